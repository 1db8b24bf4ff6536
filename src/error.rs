use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort before any job runs. Per-job failures never take this
/// shape; they are reported through each job's terminal event instead.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("transcoding engine not found or not runnable at {0:?}")]
    EngineNotFound(PathBuf),

    #[error("unable to read settings file {0:?}")]
    SettingsRead(PathBuf, #[source] std::io::Error),

    #[error("invalid settings file {0:?}")]
    SettingsParse(PathBuf, #[source] serde_json::Error),
}
