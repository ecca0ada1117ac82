use parallax_proto::WireError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid module configuration: {0}")]
    Config(String),

    #[error("dependency cycle between modules: {}", unsorted.join(", "))]
    Cycle { unsorted: Vec<String> },

    #[error("plugin for {module}: {message}")]
    Plugin { module: String, message: String },

    #[error("build of {module} failed: {message}")]
    BuildFailed { module: String, message: String },

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("manifest: {0}")]
    Manifest(#[from] toml::de::Error),

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote: {0}")]
    Remote(#[from] WireError),

    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn plugin(module: impl Into<String>, message: impl ToString) -> Self {
        Self::Plugin {
            module: module.into(),
            message: message.to_string(),
        }
    }
}
