use thiserror::Error;

use super::bind::BindError;

/// 配置管理相关错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load source {source_name}: {cause}")]
    SourceLoad {
        source_name: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("source {source_name} stopped watching: {message}")]
    SourceWatch {
        source_name: String,
        message: String,
    },

    #[error("validation rejected merged snapshot: {0}")]
    Validation(String),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("invalid manager config: {0}")]
    InvalidConfig(String),

    #[error("registry error: {0}")]
    Registry(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
