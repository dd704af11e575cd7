// Error types for contract violations.
//
// Library functions return anyhow::Result; these variants are the ones callers
// may want to match on (strict-load failures, disabled heads, bad config).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EldmError {
    /// Strict load: variables the file does not provide.
    #[error("missing keys in {source_name}: {keys:?}")]
    MissingKeys { source_name: String, keys: Vec<String> },

    /// Strict load: tensors in the file with no matching variable.
    #[error("unexpected keys in {source_name}: {keys:?}")]
    UnexpectedKeys { source_name: String, keys: Vec<String> },

    #[error("shape mismatch for {key}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Global pooling is off but no channel mapper was built.
    #[error("channel mapper is required when global pooling is disabled")]
    MissingChannelMapper,

    #[error("{0} head was not enabled at construction")]
    HeadDisabled(&'static str),

    #[error("no input items to process")]
    EmptyInput,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
