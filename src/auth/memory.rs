use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{IdentityProvider, Session};
use crate::error::Error;

const TOKEN_LIFETIME_SECS: i64 = 3600;

struct Credential {
    user_id: String,
    password: String,
    admin_role: bool,
}

#[derive(Default)]
struct State {
    credentials: HashMap<String, Credential>,
    session: Option<Session>,
}

/// In-process identity provider for tests and the demo binary.
///
/// Issues real (locally signed) JWT access tokens so role claims travel the
/// same way they do with a hosted backend.
pub struct MemoryIdentityProvider {
    state: Mutex<State>,
    secret: String,
    auth_state: watch::Sender<Option<String>>,
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        let (auth_state, _) = watch::channel(None);
        Self {
            state: Mutex::new(State::default()),
            secret: Uuid::new_v4().to_string(),
            auth_state,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put the admin role claim into future tokens of this email.
    /// Returns false if no such credential exists.
    pub fn grant_admin_role(&self, email: &str) -> bool {
        match self.lock().credentials.get_mut(&normalize(email)) {
            Some(credential) => {
                credential.admin_role = true;
                true
            }
            None => false,
        }
    }

    fn issue_token(&self, user_id: &str, email: &str, admin_role: bool) -> Result<String, Error> {
        let now = chrono::Utc::now().timestamp();
        let role = if admin_role { "admin" } else { "authenticated" };
        let claims = json!({
            "sub": user_id,
            "email": email,
            "role": "authenticated",
            "app_metadata": { "role": role },
            "iat": now,
            "exp": now + TOKEN_LIFETIME_SECS,
        });
        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?)
    }
}

fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn sign_up(&self, email: &str, password: &str) -> Result<String, Error> {
        let email = normalize(email);
        let mut state = self.lock();
        if state.credentials.contains_key(&email) {
            return Err(Error::auth(format!("{email} is already registered")));
        }

        let user_id = Uuid::new_v4().to_string();
        state.credentials.insert(
            email.clone(),
            Credential {
                user_id: user_id.clone(),
                password: password.to_string(),
                admin_role: false,
            },
        );
        debug!("Created credentials for {}", email);
        Ok(user_id)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, Error> {
        let email = normalize(email);
        let (user_id, admin_role) = {
            let state = self.lock();
            match state.credentials.get(&email) {
                Some(c) if c.password == password => (c.user_id.clone(), c.admin_role),
                _ => {
                    warn!("Rejected sign-in for {}", email);
                    return Err(Error::auth("Invalid login credentials"));
                }
            }
        };

        let access_token = self.issue_token(&user_id, &email, admin_role)?;
        let session = Session::new(
            access_token,
            Uuid::new_v4().to_string(),
            user_id.clone(),
            email,
            TOKEN_LIFETIME_SECS,
        );
        self.lock().session = Some(session.clone());
        self.auth_state.send_replace(Some(user_id));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), Error> {
        if self.lock().session.take().is_none() {
            return Err(Error::auth("Not logged in"));
        }
        self.auth_state.send_replace(None);
        Ok(())
    }

    fn current_session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    fn on_auth_state_changed(&self) -> watch::Receiver<Option<String>> {
        self.auth_state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_up_then_sign_in() {
        let provider = MemoryIdentityProvider::new();
        let user_id = provider.sign_up("Ana@Example.org", "secret1").await.unwrap();

        assert!(matches!(
            provider.sign_up("ana@example.org", "other").await,
            Err(Error::Authentication(_))
        ));
        assert!(matches!(
            provider.sign_in("ana@example.org", "wrong").await,
            Err(Error::Authentication(_))
        ));

        let session = provider.sign_in("ana@example.org", "secret1").await.unwrap();
        assert_eq!(session.user_id, user_id);
        assert!(!session.claims().unwrap().is_admin());
        assert_eq!(*provider.on_auth_state_changed().borrow(), Some(user_id));

        provider.sign_out().await.unwrap();
        assert!(provider.current_session().is_none());
    }

    #[tokio::test]
    async fn granted_role_shows_up_in_token_claims() {
        let provider = MemoryIdentityProvider::new();
        provider.sign_up("root@example.org", "secret1").await.unwrap();
        assert!(provider.grant_admin_role("root@example.org"));
        assert!(!provider.grant_admin_role("nobody@example.org"));

        let session = provider.sign_in("root@example.org", "secret1").await.unwrap();
        assert!(session.claims().unwrap().is_admin());
    }
}
