use std::path::PathBuf;

/// Errors surfaced by the store.
///
/// Values travel inside [`anyhow::Error`] and are recovered with
/// `downcast_ref` where callers need to branch on the kind.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("ambiguous key: {0:?}")]
    AmbiguousKey(String),
    #[error("error decompressing image: {0}")]
    Decompression(String),
    #[error("error extracting image manifest: {0}")]
    Manifest(String),
    #[error("error importing blob: {0}")]
    Import(String),
    #[error("metadata index failure: {0}")]
    Index(String),
    #[error("rendering would overwrite {}", .0.display())]
    RenderOverwrite(PathBuf),
    #[error("owner id {id} outside the remappable range of {size}")]
    UidRange { id: u64, size: u64 },
    #[error("some disk entries cannot be removed: {}", format_removal(.0))]
    Removal(Vec<String>),
    #[error("store schema version {stored} is newer than the supported version {expected}")]
    FutureSchema { stored: u32, expected: u32 },
}

fn format_removal(errors: &[String]) -> String {
    errors
        .iter()
        .map(|err| format!("[{err}]"))
        .collect::<Vec<_>>()
        .join("")
}

impl StoreError {
    /// Whether an error chain bottoms out in [`StoreError::NotFound`].
    #[must_use]
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Self>(), Some(Self::NotFound(_)))
    }
}
