use thiserror::Error;

/// Errors produced by the layout engine.
///
/// Callers either recover locally (e.g. `IndexNotSavedCleanly` on a fresh
/// index) or propagate. No error is silently demoted.
#[derive(Error, Debug)]
pub enum LayoutError {
    /// The first header block did not carry the region magic: this backing
    /// store has never been formatted.
    #[error("no index found on backing store")]
    NoIndex,

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("page size not a multiple of block size")]
    IncorrectAlignment,

    #[error("bad state: {0}")]
    BadState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unexpected result: {0}")]
    UnexpectedResult(String),

    #[error("insufficient space: {available} bytes available, {required} required")]
    NoSpace { available: u64, required: u64 },

    /// No save slot passed validation; the index was not shut down cleanly.
    #[error("index not saved cleanly")]
    IndexNotSavedCleanly,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LayoutError {
    /// Wrap an error with a context string naming the region or operation
    /// that failed, preserving the kind where callers dispatch on it.
    pub fn context(self, what: &str) -> LayoutError {
        match self {
            LayoutError::NoIndex => LayoutError::NoIndex,
            LayoutError::IndexNotSavedCleanly => LayoutError::IndexNotSavedCleanly,
            LayoutError::IncorrectAlignment => LayoutError::IncorrectAlignment,
            LayoutError::NoSpace { available, required } => {
                LayoutError::NoSpace { available, required }
            }
            LayoutError::CorruptData(msg) => LayoutError::CorruptData(format!("{what}: {msg}")),
            LayoutError::UnsupportedVersion(msg) => {
                LayoutError::UnsupportedVersion(format!("{what}: {msg}"))
            }
            LayoutError::BadState(msg) => LayoutError::BadState(format!("{what}: {msg}")),
            LayoutError::InvalidArgument(msg) => {
                LayoutError::InvalidArgument(format!("{what}: {msg}"))
            }
            LayoutError::UnexpectedResult(msg) => {
                LayoutError::UnexpectedResult(format!("{what}: {msg}"))
            }
            LayoutError::Io(e) => {
                LayoutError::Io(std::io::Error::new(e.kind(), format!("{what}: {e}")))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, LayoutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_kind() {
        let err = LayoutError::CorruptData("nonce mismatch".into()).context("superblock");
        assert!(matches!(err, LayoutError::CorruptData(_)));
        assert!(err.to_string().contains("superblock"));
    }

    #[test]
    fn context_leaves_no_index_alone() {
        let err = LayoutError::NoIndex.context("first read");
        assert!(matches!(err, LayoutError::NoIndex));
    }
}
