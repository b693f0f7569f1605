use thiserror::Error;

/// Result type for ristretto operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the interpreter. All of them are fatal to the running
/// program; there is no in-language exception model in this core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Link error: {message}")]
    Link { message: String },

    #[error("Bytecode error: {message}")]
    Bytecode { message: String },

    #[error("Constant pool type error: {message}")]
    Type { message: String },
}

impl Error {
    /// Create a parse error for a malformed class file.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into() }
    }

    /// Create a link error (class or method not found).
    pub fn link(message: impl Into<String>) -> Self {
        Self::Link { message: message.into() }
    }

    /// Create a bytecode execution error.
    pub fn bytecode(message: impl Into<String>) -> Self {
        Self::Bytecode { message: message.into() }
    }

    /// Create a constant pool tag mismatch error.
    pub fn tag(message: impl Into<String>) -> Self {
        Self::Type { message: message.into() }
    }
}
