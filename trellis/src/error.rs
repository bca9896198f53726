use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrellisError {
    #[error("Invalid frequency: {name} is not part of the {space} space")]
    InvalidFrequency { name: String, space: String },

    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("Row not found: no {frequency} row at [{coordinates}]")]
    RowNotFound {
        frequency: String,
        coordinates: String,
    },

    #[error("Incompatible frequency: column {column} is {column_frequency}, row is {row_frequency}")]
    IncompatibleFrequency {
        column: String,
        column_frequency: String,
        row_frequency: String,
    },

    #[error("No match for column {column} in row [{coordinates}]")]
    FileNotFound { column: String, coordinates: String },

    #[error("Ambiguous match for column {column} in row [{coordinates}]: {candidates}")]
    AmbiguousMatch {
        column: String,
        coordinates: String,
        candidates: String,
    },

    #[error("Unsupported conversion: {from} -> {to}")]
    UnsupportedConversion { from: String, to: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store entry not found: {0}")]
    StoreNotFound(String),

    #[error("Malformed dataset definition: {0}")]
    Definition(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Usage(String),
}

impl TrellisError {
    /// Transient store failures are the only errors worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, TrellisError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;
