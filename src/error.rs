//! Error handling for the donation ledger

use std::fmt;
use thiserror::Error;

/// Unified error type for ledger, offer, redemption and collaborator failures
#[derive(Error, Debug)]
pub enum Error {
    /// A debit would have taken the balance below zero. Nothing was written.
    #[error("Insufficient balance: {required} points required, {available} available")]
    InsufficientBalance {
        /// Points the operation needed
        required: u64,
        /// Points on the account when the debit was evaluated
        available: u64,
    },

    /// The offer is not (or no longer) in the active set
    #[error("Offer not found: {0}")]
    OfferNotFound(String),

    /// No user account exists for the id
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Bad credentials or a sign-in/sign-up policy violation
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The caller does not hold the capability the operation requires
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Form validation failures
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Merge-update or transactional update against a missing record
    #[error("Record not found: {collection}/{id}")]
    RecordNotFound {
        /// Collection name
        collection: String,
        /// Record id
        id: String,
    },

    /// The store gave up after repeated read/write conflicts
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    /// Network or HTTP transport failures
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The realtime change feed could not connect or lost its connection
    #[error("Realtime error: {0}")]
    Realtime(String),

    /// A collaborator answered with a non-success status
    #[error("Request failed with status {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body or error description
        message: String,
    },

    /// The text completion service returned an unusable answer
    #[error("Completion error: {0}")]
    Completion(String),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Session token decoding errors
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Missing or malformed configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new authentication error
    pub fn auth<T: fmt::Display>(msg: T) -> Self {
        Error::Authentication(msg.to_string())
    }

    /// Create a new permission error
    pub fn permission<T: fmt::Display>(msg: T) -> Self {
        Error::PermissionDenied(msg.to_string())
    }

    /// Create a new validation error
    pub fn invalid<T: fmt::Display>(msg: T) -> Self {
        Error::InvalidInput(msg.to_string())
    }

    /// Create a new conflict error
    pub fn conflict<T: fmt::Display>(msg: T) -> Self {
        Error::Conflict(msg.to_string())
    }

    /// Create a new completion error
    pub fn completion<T: fmt::Display>(msg: T) -> Self {
        Error::Completion(msg.to_string())
    }

    /// Create a new configuration error
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new realtime feed error
    pub fn realtime<T: fmt::Display>(msg: T) -> Self {
        Error::Realtime(msg.to_string())
    }

    /// Create a record-not-found error
    pub fn record_not_found(collection: &str, id: &str) -> Self {
        Error::RecordNotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    /// Whether this is a transient connectivity failure to a collaborator.
    ///
    /// Requests surface these immediately. Only the realtime change feed
    /// reconnects after them.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Realtime(_))
    }
}
