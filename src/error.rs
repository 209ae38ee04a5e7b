use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt image: {message}")]
    CorruptImage { message: String },
    #[error("Image version mismatch: found {found}")]
    VersionMismatch { found: String },
    #[error("Image checksum does not match its contents")]
    ChecksumMismatch,
    #[error("Cannot modify {kind} '{name}' while a binary image is loaded")]
    ConstructLocked { kind: &'static str, name: String },
    #[error("Relocation of {kind} record {index} failed: {message}")]
    Relocation { kind: &'static str, index: usize, message: String },
    #[error("Unknown module: {0}")]
    UnknownModule(String),
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Evaluation error: {0}")]
    Evaluation(String),
    #[error("Binary item dependency error: {0}")]
    DependencyCycle(String),
    #[error("Usage: {0}")]
    Usage(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, ImageError>;

impl ImageError {
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptImage { message: message.into() }
    }
}

// Helper conversions
impl From<config::ConfigError> for ImageError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
