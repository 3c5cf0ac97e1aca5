/// Result alias that carries the custom [`DriftError`] type.
pub type Result<T> = std::result::Result<T, DriftError>;

/// Coarse classification of every failure the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad audio, pattern or configuration data. The run never arms.
    Input,
    /// A limit was (or would be) exceeded. Always aborts.
    Safety,
    /// The actuation backend failed, rejected or timed out.
    Backend,
    /// The core reached a state it should never be in.
    Internal,
}

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum DriftError {
    /// The audio container or codec cannot be decoded.
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
    /// No reliable beat could be extracted from the track.
    #[error("insufficient signal: {0}")]
    InsufficientSignal(String),
    /// A pattern or timeline is missing required fields or breaks an invariant.
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("unknown maneuver kind `{0}`")]
    UnknownManeuverKind(String),
    /// A step anchor points past the analysed track.
    #[error("anchor of step `{step}` is out of range: {detail}")]
    AnchorOutOfRange { step: String, detail: String },
    #[error("safety violation: {0}")]
    SafetyViolation(String),
    #[error("run cannot be armed: {0}")]
    NotArmable(String),
    #[error("actuation backend error: {0}")]
    Backend(String),
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl DriftError {
    /// Returns the taxonomy bucket this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnsupportedFormat(_)
            | Self::InsufficientSignal(_)
            | Self::SchemaViolation(_)
            | Self::UnknownManeuverKind(_)
            | Self::AnchorOutOfRange { .. }
            | Self::NotArmable(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Yaml(_)
            | Self::Json(_) => ErrorClass::Input,
            Self::SafetyViolation(_) => ErrorClass::Safety,
            Self::Backend(_) => ErrorClass::Backend,
            Self::InternalInconsistency(_) => ErrorClass::Internal,
        }
    }

    pub fn schema<T: Into<String>>(msg: T) -> Self {
        Self::SchemaViolation(msg.into())
    }

    pub fn internal<T: Into<String>>(msg: T) -> Self {
        Self::InternalInconsistency(msg.into())
    }
}
