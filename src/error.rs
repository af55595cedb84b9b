use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhysioError {
    /// 输入文件无法解析：跳过该文件，会话继续
    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    /// 找不到扫描目录或功能像：整个会话终止
    #[error("Scan catalog error: {0}")]
    Catalog(String),

    #[error("Failed to write {path}: {message}")]
    Write { path: String, message: String },

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("Invalid channel set: {0}")]
    InvalidChannelSet(String),

    #[error("Invalid events: {0}")]
    InvalidEvents(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PhysioError {
    /// Builds a [`PhysioError::Parse`] for the given input file.
    pub fn parse<P: AsRef<std::path::Path>>(path: P, message: impl Into<String>) -> Self {
        PhysioError::Parse {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// Builds a [`PhysioError::Write`] for the given output file.
    pub fn write<P: AsRef<std::path::Path>>(path: P, message: impl Into<String>) -> Self {
        PhysioError::Write {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// Only a catalog failure aborts a session; everything else is per file.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, PhysioError::Catalog(_))
    }
}

pub type Result<T> = std::result::Result<T, PhysioError>;
