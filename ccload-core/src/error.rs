use thiserror::Error;

/// The typed error surface returned by every repository and by the composite
/// [`crate::store::Store`]. Internals use `anyhow::Result` and are funneled into
/// one of these variants at the boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("transient database error: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("redis: {0}")]
    Redis(#[source] anyhow::Error),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maps a `sqlx::Error` to the taxonomy of §7: unique-constraint violations become
/// `Conflict`, a missing row becomes `NotFound`, busy/locked conditions become
/// `Transient`, everything else is surfaced as `Transient` too (the caller may retry;
/// a hard I/O failure on the logs database should be escalated to `Fatal` by the
/// caller, since only the caller knows which database was involved).
pub fn classify_sqlx_error(err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::RowNotFound => Error::NotFound,
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            Error::Conflict(db_err.message().to_string())
        }
        _ => Error::Transient(anyhow::Error::new(err)),
    }
}

impl From<fred::error::Error> for Error {
    fn from(err: fred::error::Error) -> Self {
        Error::Redis(anyhow::Error::new(err))
    }
}
