/// Result alias that carries the custom [`OrbError`] type.
pub type Result<T> = std::result::Result<T, OrbError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum OrbError {
    /// Microphone access was refused by the user or the platform.
    #[error("microphone permission denied: {0}")]
    Permission(String),
    /// The input device is missing or the capture stream could not be built.
    #[error("audio device error: {0}")]
    Device(String),
    /// One of the GPU initialisation stages failed.
    #[error(transparent)]
    GpuInit(#[from] GpuInitError),
    /// A draw call failed after the renderer was initialised.
    #[error("draw failed: {0}")]
    Draw(String),
    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Message(String),
}

impl OrbError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// True for failures the user can fix by granting access or plugging in a
    /// device and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Permission(_) | Self::Device(_))
    }

    /// Copies the error. Variants wrapping a source that cannot be cloned
    /// become [`OrbError::Message`] with the same text.
    pub fn replicate(&self) -> Self {
        match self {
            Self::Permission(message) => Self::Permission(message.clone()),
            Self::Device(message) => Self::Device(message.clone()),
            Self::GpuInit(err) => Self::GpuInit(err.clone()),
            Self::Draw(message) => Self::Draw(message.clone()),
            Self::Config(_) | Self::Io(_) => Self::Message(self.to_string()),
            Self::Message(message) => Self::Message(message.clone()),
        }
    }
}

impl From<&str> for OrbError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for OrbError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Shader stage reported in compile failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vertex => f.write_str("vertex"),
            Self::Fragment => f.write_str("fragment"),
        }
    }
}

/// The GPU initialisation stage that failed. Every variant sends the pipeline
/// to the fallback renderer for the rest of the activation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GpuInitError {
    #[error("GPU drawing context unavailable")]
    ContextUnavailable,
    #[error("{stage} shader failed to compile: {log}")]
    ShaderCompile { stage: ShaderStage, log: String },
    #[error("shader program failed to link: {0}")]
    ProgramLink(String),
    #[error("vertex attribute `{0}` not found")]
    MissingAttribute(String),
    #[error("uniform `{0}` not found")]
    MissingUniform(String),
    #[error("vertex buffer could not be created: {0}")]
    Buffer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_microphone_failures_are_retryable() {
        assert!(OrbError::Permission("denied".into()).is_retryable());
        assert!(OrbError::Device("no input".into()).is_retryable());
        assert!(!OrbError::from(GpuInitError::ContextUnavailable).is_retryable());
        assert!(!OrbError::Draw("lost".into()).is_retryable());
    }

    #[test]
    fn compile_errors_name_the_stage() {
        let err = GpuInitError::ShaderCompile {
            stage: ShaderStage::Fragment,
            log: "syntax error".into(),
        };
        assert_eq!(
            err.to_string(),
            "fragment shader failed to compile: syntax error"
        );
    }

    #[test]
    fn replicate_keeps_message_variants() {
        let denied = OrbError::Permission("NotAllowedError".into()).replicate();
        assert!(matches!(denied, OrbError::Permission(ref m) if m == "NotAllowedError"));

        let io = OrbError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        let copy = io.replicate();
        assert!(matches!(copy, OrbError::Message(_)));
        assert_eq!(copy.to_string(), io.to_string());
    }
}
