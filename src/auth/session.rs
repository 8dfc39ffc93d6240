//! Sessions, token claims and the admin capability

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

const ADMIN_ROLE: &str = "admin";

/// Session data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// The access token
    pub access_token: String,

    /// The refresh token
    pub refresh_token: String,

    /// The user ID
    pub user_id: String,

    /// The signed-in email
    pub email: String,

    /// The token type
    pub token_type: String,

    /// The expiry time in seconds
    pub expires_in: i64,

    /// The expiry timestamp
    pub expires_at: Option<i64>,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}

impl Session {
    /// Create a new session
    pub fn new(
        access_token: String,
        refresh_token: String,
        user_id: String,
        email: String,
        expires_in: i64,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            user_id,
            email,
            token_type: "bearer".to_string(),
            expires_in,
            expires_at: Some(now_secs() + expires_in),
        }
    }

    /// Check if the session has expired
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => now_secs() >= expires_at,
            None => false,
        }
    }

    /// Read the claims of the access token.
    ///
    /// The signature is not checked. Only use this on tokens received from
    /// the identity provider.
    pub fn claims(&self) -> Result<TokenClaims, Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<TokenClaims>(
            &self.access_token,
            &DecodingKey::from_secret(&[]),
            &validation,
        )?;
        Ok(data.claims)
    }
}

/// Claims of an access token this crate cares about
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user id)
    #[serde(default)]
    pub sub: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Database role of the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub app_metadata: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl TokenClaims {
    /// Whether the token carries the admin role, either as its own role or in
    /// the provider-managed app metadata
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
            || self.app_metadata.get("role").and_then(Value::as_str) == Some(ADMIN_ROLE)
    }
}

/// Role of a signed-in user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
}

/// Proof that the holder was resolved as an administrator at session start.
///
/// Only [`SessionContext`] hands these out, so a privileged operation that
/// takes `&AdminCapability` cannot be called by a member session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCapability {
    admin_id: String,
}

impl AdminCapability {
    pub(crate) fn new(admin_id: &str) -> Self {
        Self {
            admin_id: admin_id.to_string(),
        }
    }

    /// The user id of the administrator
    pub fn admin_id(&self) -> &str {
        &self.admin_id
    }
}

/// A signed-in user with the role resolved once at sign-in
#[derive(Debug, Clone)]
pub struct SessionContext {
    session: Session,
    role: Role,
    capability: Option<AdminCapability>,
}

impl SessionContext {
    pub(crate) fn new(session: Session, role: Role) -> Self {
        let capability = match role {
            Role::Admin => Some(AdminCapability::new(&session.user_id)),
            Role::Member => None,
        };
        Self {
            session,
            role,
            capability,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.session.user_id
    }

    pub fn email(&self) -> &str {
        &self.session.email
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_admin(&self) -> bool {
        self.capability.is_some()
    }

    /// The admin capability, or `PermissionDenied` for a member session
    pub fn admin(&self) -> Result<&AdminCapability, Error> {
        self.capability
            .as_ref()
            .ok_or_else(|| Error::permission("administrator role required"))
    }
}
