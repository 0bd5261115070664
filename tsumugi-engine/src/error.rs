//! Error taxonomy for the runtime

/// Errors that can occur while building or driving the engine.
///
/// Every kind is fatal to the operation that produced it; `Capacity` is the
/// one exception and is handled inside the forward pass (the engine answers
/// with an end-of-text logits vector instead of failing).
#[derive(Debug, thiserror::Error)]
pub enum RtError {
    /// Malformed run configuration: bad JSON, missing key, out-of-range enum.
    #[error("config: {0}")]
    Config(String),

    /// Checkpoint does not match the model configuration: tensor shape or
    /// dtype mismatch, unsupported conversion, missing required tensor.
    #[error("model: {0}")]
    Model(String),

    /// Value outside the representable range of a packed float format, or
    /// a kernel self-check outside its documented error bounds.
    #[error("numeric: {0}")]
    Numeric(String),

    /// The CPU lacks a required instruction set.
    #[error("capability: {0}")]
    Capability(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Context full while compaction is disabled.
    #[error("capacity: context is full ({0} tokens) and compaction is disabled")]
    Capacity(usize),
}

pub type Result<T> = std::result::Result<T, RtError>;
