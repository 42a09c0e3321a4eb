use thiserror::Error;

/// Caller supplied identifier of an item.
pub type ItemKey = u64;

/// Errors surfaced at the session boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed attribute mask or engine configuration. Fatal at setup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// An attribute that is not part of the session's mask.
    #[error("attribute `{0}` is not in the attribute mask")]
    UnknownAttribute(String),
    /// Operation on an unknown or removed item.
    #[error("unknown item identifier: {0}")]
    InvalidIdentifier(ItemKey),
    /// The same key was added twice inside one transaction.
    #[error("item {0} is added twice in the same transaction")]
    DuplicateIdentifier(ItemKey),
    /// A transaction panicked while the session was locked; its state is unreliable.
    #[error("session `{0}` was poisoned by a panicking transaction")]
    Poisoned(String),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
