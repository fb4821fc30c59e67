use thiserror::Error;

/// The complete error taxonomy for the coordination kernel.
///
/// Every fallible operation in the crate returns one of these variants rather
/// than a bare `String`; wire-level error replies (`ADD_MODULE_ERROR`,
/// `REMOVE_MODULE_ERROR`, `PARSER_ERROR`) carry `to_string()` of the variant
/// that triggered them.
#[derive(Debug, Error)]
pub enum WatershedError {
    /// Rank out of range, null payload, invalid tag, oversized field.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Cannot open/lock a running directory, cannot load a user library.
    #[error("file operation failed: {0}")]
    FileOperation(String),

    /// Invalid descriptor or cluster configuration.
    #[error("descriptor parse error: {0}")]
    DescriptorParse(String),

    /// No eligible hosts, or a spawn invocation under-delivered instances.
    #[error("process spawn failed: {0}")]
    ProcessSpawn(String),

    /// No runtime owns the named module/instance being removed.
    #[error("process removal failed: {0}")]
    ProcessRemove(String),

    /// The statically linked user library is missing its factory entry point.
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// Transport-level failure (connect/send/recv/probe).
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WatershedError>;
