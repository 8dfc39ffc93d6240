//! Identity Provider: credential sign-up/sign-in collaborator

mod memory;
mod session;
mod types;

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Error;
use crate::fetch::{ensure_success, Fetch};

pub use memory::MemoryIdentityProvider;
pub use session::*;
pub use types::*;

/// Interface of the identity backend
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Create credentials and return the new user id
    async fn sign_up(&self, email: &str, password: &str) -> Result<String, Error>;

    /// Check credentials and start a session
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, Error>;

    /// End the current session
    async fn sign_out(&self) -> Result<(), Error>;

    /// The current session, if signed in
    fn current_session(&self) -> Option<Session>;

    /// Signed-in user id, updated on every sign-in and sign-out
    fn on_auth_state_changed(&self) -> watch::Receiver<Option<String>>;
}

#[derive(Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

/// Client for a GoTrue-style `/auth/v1` identity backend
pub struct HttpIdentityProvider {
    /// The base URL of the backend
    url: String,

    /// The API key of the backend
    key: String,

    /// HTTP client used for requests
    client: Client,

    /// The current session
    session: Mutex<Option<Session>>,

    state: watch::Sender<Option<String>>,
}

impl HttpIdentityProvider {
    /// Create a new identity client
    pub fn new(url: &str, key: &str, client: Client) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            client,
            session: Mutex::new(None),
            state,
        }
    }

    fn get_auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1{}", self.url, path)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_session(&self, session: Option<Session>) {
        let user_id = session.as_ref().map(|s| s.user_id.clone());
        *self.lock() = session;
        self.state.send_replace(user_id);
    }

    async fn post_credentials(
        &self,
        path: &str,
        query: &[(&str, &str)],
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, Error> {
        let response = Fetch::post(&self.client, &self.get_auth_url(path))
            .header("apikey", &self.key)
            .query(query.iter().copied())
            .json(&Credentials { email, password })?
            .execute_raw()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<AuthErrorBody>(&text)
                .ok()
                .and_then(AuthErrorBody::describe)
                .unwrap_or(text);
            warn!("Identity backend rejected {} ({}): {}", path, status, reason);
            return Err(Error::auth(reason));
        }

        let response = ensure_success(response).await?;
        Ok(response.json::<AuthResponse>().await?)
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn sign_up(&self, email: &str, password: &str) -> Result<String, Error> {
        let result = self.post_credentials("/signup", &[], email, password).await?;
        let user_id = result
            .user_id()
            .map(str::to_string)
            .ok_or_else(|| Error::auth("sign-up response carried no user"))?;

        // Backends without email confirmation sign the new user in right away
        if let Some(session) = result.into_session(email) {
            self.store_session(Some(session));
        }
        debug!("Signed up user {}", user_id);
        Ok(user_id)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, Error> {
        let result = self
            .post_credentials("/token", &[("grant_type", "password")], email, password)
            .await?;
        let session = result
            .into_session(email)
            .ok_or_else(|| Error::auth("sign-in response carried no session"))?;

        self.store_session(Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), Error> {
        let token = match self.lock().as_ref() {
            Some(session) => session.access_token.clone(),
            None => return Err(Error::auth("Not logged in")),
        };

        let response = Fetch::post(&self.client, &self.get_auth_url("/logout"))
            .header("apikey", &self.key)
            .bearer_auth(&token)
            .execute_raw()
            .await?;
        ensure_success(response).await?;

        self.store_session(None);
        Ok(())
    }

    fn current_session(&self) -> Option<Session> {
        self.lock().clone()
    }

    fn on_auth_state_changed(&self) -> watch::Receiver<Option<String>> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_body(user_id: &str) -> serde_json::Value {
        json!({
            "access_token": "test_access_token",
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": "test_refresh_token",
            "user": {
                "id": user_id,
                "email": "ana@example.org",
                "role": "authenticated"
            }
        })
    }

    #[tokio::test]
    async fn test_sign_in_stores_session_and_notifies() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "anon"))
            .and(body_json(json!({ "email": "ana@example.org", "password": "secret1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body("user-1")))
            .mount(&mock_server)
            .await;

        let provider = HttpIdentityProvider::new(&mock_server.uri(), "anon", Client::new());
        let state = provider.on_auth_state_changed();

        let session = provider.sign_in("ana@example.org", "secret1").await.unwrap();
        assert_eq!(session.user_id, "user-1");
        assert_eq!(session.access_token, "test_access_token");
        assert_eq!(provider.current_session(), Some(session));
        assert_eq!(*state.borrow(), Some("user-1".to_string()));
    }

    #[tokio::test]
    async fn test_bad_credentials_are_authentication_failures() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })))
            .mount(&mock_server)
            .await;

        let provider = HttpIdentityProvider::new(&mock_server.uri(), "anon", Client::new());
        let result = provider.sign_in("ana@example.org", "wrong").await;

        match result {
            Err(Error::Authentication(reason)) => assert_eq!(reason, "Invalid login credentials"),
            other => panic!("unexpected result: {:?}", other.map(|s| s.user_id)),
        }
        assert!(provider.current_session().is_none());
    }

    #[tokio::test]
    async fn test_sign_up_without_session_returns_user_id() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "user-2",
                "email": "ben@example.org"
            })))
            .mount(&mock_server)
            .await;

        let provider = HttpIdentityProvider::new(&mock_server.uri(), "anon", Client::new());
        let user_id = provider.sign_up("ben@example.org", "secret1").await.unwrap();

        assert_eq!(user_id, "user-2");
        assert!(provider.current_session().is_none());
    }

    #[tokio::test]
    async fn test_sign_out_clears_session() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body("user-1")))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(header("authorization", "Bearer test_access_token"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = HttpIdentityProvider::new(&mock_server.uri(), "anon", Client::new());
        provider.sign_in("ana@example.org", "secret1").await.unwrap();
        provider.sign_out().await.unwrap();

        assert!(provider.current_session().is_none());
        assert_eq!(*provider.on_auth_state_changed().borrow(), None);
        assert!(provider.sign_out().await.is_err());
    }

    #[tokio::test]
    async fn test_server_errors_are_api_errors() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&mock_server)
            .await;

        let provider = HttpIdentityProvider::new(&mock_server.uri(), "anon", Client::new());
        let result = provider.sign_up("ana@example.org", "secret1").await;
        assert!(matches!(result, Err(Error::Api { status: 503, .. })));
    }
}
