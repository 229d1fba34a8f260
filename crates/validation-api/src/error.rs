use std::io;
use std::path::PathBuf;

use validation_core::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("serde error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unsupported config schema version {0:?}")]
    UnsupportedSchema(String),

    #[error("no *.jsonl trace files under {0}")]
    NoTraceFiles(PathBuf),

    #[error("sqlite store is not attached")]
    NotAttached,

    #[error("run {0:?} is already archived")]
    RunAlreadyExists(String),
}

impl ApiError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Caused by what the caller supplied rather than by the environment.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::Json(_)
                | Self::Validation(_)
                | Self::UnsupportedSchema(_)
                | Self::NoTraceFiles(_)
                | Self::RunAlreadyExists(_)
        )
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
