use thiserror::Error;

#[derive(Error, Debug)]
pub enum PycellError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Container runtime errors
    #[error("Container runtime unavailable: {reason}")]
    RuntimeUnavailable { reason: String },

    #[error("Runtime image '{tag}' not found. Build it manually with: {hint}")]
    ImageMissing { tag: String, hint: String },

    #[error("Image build failed for '{tag}': {message}")]
    BuildFailed { tag: String, message: String },

    // Sandbox errors
    #[error("Sandbox creation failed: {0}")]
    SandboxCreateFailed(String),

    #[error("Sandbox not found: {id}")]
    SandboxNotFound { id: String },

    #[error("Command execution failed in sandbox: {0}")]
    SandboxExecution(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PycellError {
    /// Setup-time failures that block any further progress, as opposed to
    /// per-operation failures that are returned as structured results.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RuntimeUnavailable { .. } | Self::ImageMissing { .. } | Self::BuildFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PycellError>;
