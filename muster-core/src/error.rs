use thiserror::Error;

use crate::client::ClientError;
use crate::vault::VaultError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Insert handshake against the fleet server failed. Fatal to the
    /// registration; no row is written.
    #[error("fleet server at {url} is unreachable: {source}")]
    ServerUnreachable {
        url: String,
        #[source]
        source: ClientError,
    },

    /// Emergency service-account provisioning failed. Carried as a warning
    /// on the registration outcome, never as a hard failure.
    #[error("service account setup failed on {url}: {source}")]
    ServiceAccountSetup {
        url: String,
        #[source]
        source: ClientError,
    },

    #[error("invalid fleet server url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("no fleet server matching {0}")]
    UnknownServer(String),

    #[error("a fleet server with url {0} is already registered")]
    UrlAlreadyRegistered(String),

    #[error("no emergency password is stored for {0}")]
    EmergencyNotSet(String),

    #[error("credential decryption failed: {0}")]
    Decryption(#[from] VaultError),

    #[error("fleet server request failed: {0}")]
    Client(#[from] ClientError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("document store error: {0}")]
    DocumentStore(#[from] mongodb::error::Error),

    #[error("malformed inventory payload: {0}")]
    MalformedInventory(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
