use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("migration {key} failed: {message}")]
    Migration { key: String, message: String },

    #[error("schedule error: {0}")]
    Schedule(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for failures raised by a migration body, as opposed to
    /// infrastructure failures around it.
    pub fn is_migration_failure(&self) -> bool {
        matches!(self, Error::Migration { .. })
    }
}
