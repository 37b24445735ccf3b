pub mod args;
pub mod builder;
pub mod client;
pub mod compiler;
pub mod config;
pub mod fingerprint;
pub mod preprocess;
pub mod scheduler;
pub mod select;
pub mod slots;
pub mod watchdog;
pub mod websocket;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the client/scheduler contract advertised during the handshake.
pub const CONFIG_VERSION: u32 = 6;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Generic(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Generic(message.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
