use thiserror::Error;

#[derive(Error, Debug)]
pub enum FinchError {
    #[error("{0}")]
    UserInput(String),

    #[error("{0}")]
    Validation(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Remote authentication failed: {0}")]
    RemoteAuth(String),

    #[error("Rate limit exhausted after {attempts} attempts: {message}")]
    RateLimited { attempts: u32, message: String },

    #[error("Archive error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Interrupted")]
    Interrupted,
}

impl FinchError {
    /// Process exit code for this error kind: 2 user input / validation,
    /// 3 remote, 4 local store, 1 everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            FinchError::UserInput(_) | FinchError::Validation(_) => 2,
            FinchError::Remote(_) | FinchError::RemoteAuth(_) | FinchError::RateLimited { .. } => 3,
            FinchError::Store(_) | FinchError::Io(_) => 4,
            FinchError::Interrupted => 1,
        }
    }
}

impl From<reqwest::Error> for FinchError {
    fn from(e: reqwest::Error) -> Self {
        FinchError::Remote(e.to_string())
    }
}

impl From<serde_json::Error> for FinchError {
    fn from(e: serde_json::Error) -> Self {
        FinchError::Remote(format!("malformed response: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, FinchError>;
