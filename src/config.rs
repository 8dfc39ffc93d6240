//! Configuration for the donation ledger and its collaborators

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Error;

const DEFAULT_ASSISTANT_INSTRUCTIONS: &str = "You are the support assistant of a community \
donation program. Citizens post surplus items, an administrator confirms each donation and \
credits points, and points can be redeemed for vouchers. Answer briefly and politely. If a \
question needs a human, tell the user an administrator will follow up.";

/// Ledger rules and policy knobs
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Points granted to a freshly registered account
    pub starting_balance: u64,

    /// Points credited when a user posts an offer
    pub post_reward: u64,

    /// Points credited to the donor when an admin confirms an offer
    pub confirm_reward: u64,

    /// Emails that receive the admin flag at registration
    pub admin_emails: Vec<String>,

    /// When set, only emails of this domain may register or sign in
    pub allowed_email_domain: Option<String>,

    /// Minimum password length accepted at registration
    pub min_password_length: usize,

    /// How many times a store transaction is re-run after a conflict
    pub transaction_attempts: u32,

    /// The request timeout of the HTTP client shared by the collaborators
    pub request_timeout: Option<Duration>,

    /// How many recent chat messages are sent along with a support prompt
    pub chat_context_messages: usize,

    /// Preamble of every support prompt
    pub assistant_instructions: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            starting_balance: 10,
            post_reward: 5,
            confirm_reward: 5,
            admin_emails: Vec::new(),
            allowed_email_domain: None,
            min_password_length: 6,
            transaction_attempts: 5,
            request_timeout: Some(Duration::from_secs(30)),
            chat_context_messages: 10,
            assistant_instructions: DEFAULT_ASSISTANT_INSTRUCTIONS.to_string(),
        }
    }
}

impl AppConfig {
    /// Load from `DONATION_*` environment variables (and `.env`), falling back
    /// to defaults for anything unset or malformed
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let request_timeout = match env::var("DONATION_REQUEST_TIMEOUT_SECS") {
            Ok(raw) if raw.trim() == "0" => None,
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(e) => {
                    warn!("Invalid DONATION_REQUEST_TIMEOUT_SECS value: {e}");
                    defaults.request_timeout
                }
            },
            Err(_) => defaults.request_timeout,
        };

        Self {
            starting_balance: parse_or("DONATION_STARTING_BALANCE", defaults.starting_balance),
            post_reward: parse_or("DONATION_POST_REWARD", defaults.post_reward),
            confirm_reward: parse_or("DONATION_CONFIRM_REWARD", defaults.confirm_reward),
            admin_emails: env::var("DONATION_ADMIN_EMAILS")
                .map(|raw| {
                    raw.split(',')
                        .map(|e| e.trim().to_lowercase())
                        .filter(|e| !e.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            allowed_email_domain: env::var("DONATION_EMAIL_DOMAIN")
                .ok()
                .map(|d| d.trim().trim_start_matches('@').to_lowercase())
                .filter(|d| !d.is_empty()),
            min_password_length: parse_or(
                "DONATION_MIN_PASSWORD_LENGTH",
                defaults.min_password_length,
            ),
            transaction_attempts: parse_or(
                "DONATION_TRANSACTION_ATTEMPTS",
                defaults.transaction_attempts,
            ),
            request_timeout,
            chat_context_messages: parse_or(
                "DONATION_CHAT_CONTEXT_MESSAGES",
                defaults.chat_context_messages,
            ),
            assistant_instructions: env::var("DONATION_ASSISTANT_INSTRUCTIONS")
                .unwrap_or(defaults.assistant_instructions),
        }
    }

    /// Set the registration balance
    pub fn with_starting_balance(mut self, value: u64) -> Self {
        self.starting_balance = value;
        self
    }

    /// Set the reward for posting an offer
    pub fn with_post_reward(mut self, value: u64) -> Self {
        self.post_reward = value;
        self
    }

    /// Set the reward for a confirmed offer
    pub fn with_confirm_reward(mut self, value: u64) -> Self {
        self.confirm_reward = value;
        self
    }

    /// Add a bootstrap admin email
    pub fn with_admin_email(mut self, email: &str) -> Self {
        self.admin_emails.push(email.trim().to_lowercase());
        self
    }

    /// Restrict registration and sign-in to one email domain
    pub fn with_allowed_email_domain(mut self, domain: &str) -> Self {
        self.allowed_email_domain = Some(domain.trim().trim_start_matches('@').to_lowercase());
        self
    }

    /// Set the minimum password length
    pub fn with_min_password_length(mut self, value: usize) -> Self {
        self.min_password_length = value;
        self
    }

    /// Set the transaction attempt budget
    pub fn with_transaction_attempts(mut self, value: u32) -> Self {
        self.transaction_attempts = value.max(1);
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, value: Option<Duration>) -> Self {
        self.request_timeout = value;
        self
    }

    /// Set how many messages feed a support prompt
    pub fn with_chat_context_messages(mut self, value: usize) -> Self {
        self.chat_context_messages = value;
        self
    }

    /// Replace the support assistant preamble
    pub fn with_assistant_instructions(mut self, value: &str) -> Self {
        self.assistant_instructions = value.to_string();
        self
    }

    /// Whether the email is configured as a bootstrap admin
    pub fn is_bootstrap_admin(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        self.admin_emails.iter().any(|admin| *admin == email)
    }
}

/// Where the collaborators live
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the document store and identity backend
    pub backend_url: String,

    /// API key sent with every backend request
    pub backend_key: String,

    /// Base URL of the realtime change feed, usually the backend URL
    pub realtime_url: String,

    /// Base URL of the text completion API
    pub completion_url: String,

    /// API key of the text completion API
    pub completion_key: String,

    /// Completion model name
    pub completion_model: String,
}

impl BackendConfig {
    /// Create a backend configuration with the default completion endpoint
    pub fn new(backend_url: &str, backend_key: &str, completion_key: &str) -> Self {
        let backend_url = backend_url.trim_end_matches('/').to_string();
        Self {
            realtime_url: backend_url.clone(),
            backend_url,
            backend_key: backend_key.to_string(),
            completion_url: "https://generativelanguage.googleapis.com".to_string(),
            completion_key: completion_key.to_string(),
            completion_model: "gemini-1.5-flash".to_string(),
        }
    }

    /// Point the completion client at another base URL
    pub fn with_completion_url(mut self, url: &str) -> Self {
        self.completion_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Follow changes through a realtime endpoint other than the backend URL
    pub fn with_realtime_url(mut self, url: &str) -> Self {
        self.realtime_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Use another completion model
    pub fn with_completion_model(mut self, model: &str) -> Self {
        self.completion_model = model.to_string();
        self
    }

    /// Load from `DONATION_BACKEND_URL`, `DONATION_BACKEND_KEY`,
    /// `DONATION_COMPLETION_KEY` and the optional realtime URL and completion
    /// URL/model variables
    pub fn from_env() -> Result<Self, Error> {
        dotenv::dotenv().ok();

        let mut config = Self::new(
            &required("DONATION_BACKEND_URL")?,
            &required("DONATION_BACKEND_KEY")?,
            &required("DONATION_COMPLETION_KEY")?,
        );
        if let Ok(url) = env::var("DONATION_REALTIME_URL") {
            config = config.with_realtime_url(&url);
        }
        if let Ok(url) = env::var("DONATION_COMPLETION_URL") {
            config = config.with_completion_url(&url);
        }
        if let Ok(model) = env::var("DONATION_COMPLETION_MODEL") {
            config = config.with_completion_model(&model);
        }
        Ok(config)
    }
}

fn required(key: &str) -> Result<String, Error> {
    env::var(key)
        .map(|v| v.trim().to_string())
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::config(format!("{key} must be set")))
}

fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("Invalid {key} value: {e}, using default: {default}");
            default
        }),
        Err(_) => {
            info!("{key} not set, using default: {default}");
            default
        }
    }
}
