//! Wire types of the identity backend

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Session;

/// Authentication response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    /// The access token
    pub access_token: Option<String>,

    /// The refresh token
    pub refresh_token: Option<String>,

    /// The token type
    pub token_type: Option<String>,

    /// The expiry time in seconds
    pub expires_in: Option<i64>,

    /// The user data
    pub user: Option<User>,

    /// User id, sent at the top level when sign-up still needs email confirmation
    pub id: Option<String>,
}

impl AuthResponse {
    /// Id of the user the response is about
    pub fn user_id(&self) -> Option<&str> {
        self.user
            .as_ref()
            .map(|u| u.id.as_str())
            .or(self.id.as_deref())
    }

    /// Session carried by the response, if it contains tokens
    pub fn into_session(self, email: &str) -> Option<Session> {
        let user_id = self.user_id()?.to_string();
        let access_token = self.access_token?;
        let email = self
            .user
            .and_then(|u| u.email)
            .unwrap_or_else(|| email.to_string());
        let mut session = Session::new(
            access_token,
            self.refresh_token.unwrap_or_default(),
            user_id,
            email,
            self.expires_in.unwrap_or(3600),
        );
        if let Some(token_type) = self.token_type {
            session.token_type = token_type;
        }
        Some(session)
    }
}

/// User data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// The user ID
    pub id: String,

    /// The user's email address
    pub email: Option<String>,

    /// The user's role
    pub role: Option<String>,

    /// The app metadata
    #[serde(default)]
    pub app_metadata: Map<String, Value>,

    /// The creation time
    pub created_at: Option<String>,
}

/// Error body of the identity backend
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct AuthErrorBody {
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub msg: Option<String>,
    pub message: Option<String>,
}

impl AuthErrorBody {
    pub(crate) fn describe(self) -> Option<String> {
        self.error_description
            .or(self.msg)
            .or(self.message)
            .or(self.error)
    }
}
