use thiserror::Error;

/// Errors surfaced by the video boundary layer.
///
/// `InvalidState` is the only kind with an automatic recovery path: the
/// owning loop polls [`crate::VideoBackend::check_invalid_state`] once per
/// frame and the backend reinitializes itself from scratch. Everything
/// else is reported to the caller and never silently swallowed.
#[derive(Debug, Error)]
pub enum VideoError {
    /// Resource or context creation failed; the backend stays
    /// `Uninitialized` and must not be run.
    #[error("backend initialization failed: {0}")]
    Initialization(String),

    /// A mid-session fault (lost device context, dead render thread).
    #[error("backend is in an invalid state: {0}")]
    InvalidState(String),

    /// A caller bug: unbalanced pause-and-lock, double shutdown, an
    /// operation issued in the wrong lifecycle state.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(&'static str),

    /// Activation by a name no registered backend carries. The previously
    /// active backend stays active.
    #[error("no registered video backend named `{0}`")]
    ActivationNotFound(String),

    /// The operation is not available on this backend variant.
    #[error("unsupported on this backend: {0}")]
    Unsupported(&'static str),

    /// A state stream produced by an incompatible crate version.
    #[error("state stream version {found}, expected {expected}")]
    StateVersion { found: u32, expected: u32 },

    /// A state stream that ends before every field was restored.
    #[error("state stream truncated at offset {0}")]
    StateTruncated(usize),
}
