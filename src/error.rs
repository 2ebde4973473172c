#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store is not open")]
    StoreClosed,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("migration {name} failed: {source}")]
    Migration {
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// External I/O hiccups: log, abandon the cycle, try again next interval.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Io(_))
    }

    /// Failures scoped to one record; siblings keep processing.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Validation(_))
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Upstream(e.to_string())
    }
}
