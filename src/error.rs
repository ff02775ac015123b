use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error taxonomy for the crate.
///
/// Compilation errors (`Schema`, `Resolve`, `Parse`, `Arg`) are raised before
/// any SQL is sent. `Constraint` and `Driver` surface from the database and
/// roll the enclosing scope back.
#[derive(Debug, Error)]
pub enum Error {
    #[error("schema error: {0}")]
    Schema(String),

    #[error("cannot resolve field: {0}")]
    Resolve(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("argument error: {0}")]
    Arg(String),

    #[error("no active database scope")]
    NotInScope,

    #[error("constraint violation: {message}")]
    Constraint {
        table: Option<String>,
        column: Option<String>,
        message: String,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("driver error: {0}")]
    Driver(#[from] sqlx::Error),
}

impl Error {
    /// Classify a driver error, pulling out FK / NOT NULL / unique violations
    /// with whatever table/column detail the backend exposes.
    pub(crate) fn from_driver(err: sqlx::Error) -> Error {
        if let sqlx::Error::Database(ref db) = err {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            // Postgres: not_null, foreign_key, unique. SQLite: every
            // SQLITE_CONSTRAINT extended code has 19 in its low byte.
            let constraint = matches!(code.as_str(), "23502" | "23503" | "23505")
                || code
                    .parse::<u64>()
                    .map(|n| n & 0xff == 19)
                    .unwrap_or(false);
            if constraint {
                return Error::Constraint {
                    table: db.table().map(str::to_owned),
                    column: None,
                    message: db.message().to_owned(),
                };
            }
        }
        Error::Driver(err)
    }
}
