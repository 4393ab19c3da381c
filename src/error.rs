use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to set up queue table {table}"))]
    Setup {
        table: String,
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display(
        "The queue table {table} could not be found. Did you run `tableq setup {queue}`?"
    ))]
    TableNotFound { table: String, queue: String },

    #[snafu(display("Error serializing message payload"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Error returned from database"))]
    Storage {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Insert into {table} did not create a message"))]
    NothingInserted { table: String },

    #[snafu(display("Unsupported database backend: {backend}"))]
    UnsupportedBackend { backend: String },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Invalid message id: {value}"))]
    InvalidMessageId { value: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Storage { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl Error {
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn table_not_found(table: impl Into<String>, queue: impl Into<String>) -> Self {
        Self::TableNotFound {
            table: table.into(),
            queue: queue.into(),
        }
    }

    /// Whether the error came from a dropped or unusable connection rather than
    /// from the statement itself. The poll loop reconnects on these.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage { source } => is_connection_error(source),
            _ => false,
        }
    }
}

pub(crate) fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed
    )
}

/// SQLite reports `no such table`, PostgreSQL raises `undefined_table` (42P01).
pub(crate) fn is_missing_table(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("42P01") || db.message().contains("no such table")
        }
        _ => false,
    }
}
