//! Crate-wide error type for the voice bridge core.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every error kind the voice bridge core can raise.
///
/// Audio-plane errors (`AudioQueueOverflow`, `AdmissionDrop`) are recovered
/// locally by the component that raises them and are rarely propagated as
/// `Err` — they exist here so counters and logs have a stable name to key
/// off. Control-plane errors drive the `CallController` to `terminated`.
#[derive(Debug, Error)]
pub enum Error {
    /// A server event from the realtime model was malformed or incomplete.
    #[error("transient model stream error: {0}")]
    TransientModelStreamError(String),

    /// The realtime model reported a non-recoverable protocol error.
    #[error("model protocol error: {0}")]
    ModelProtocolError(String),

    /// The port pool is exhausted and the hard cap forbids creating a new one.
    #[error("port acquisition failed: pool exhausted")]
    PortAcquisitionError,

    /// The native "remove port" call refused; the conference slot is leaked.
    #[error("conference slot leak: slot {slot_id}")]
    ConferenceSlotLeak {
        /// Native slot identifier that failed to release.
        slot_id: u32,
    },

    /// A well-known "session already terminated" status from the native stack.
    ///
    /// Demoted to debug by callers and treated as a successful teardown step.
    #[error("session already terminated")]
    SessionAlreadyTerminated,

    /// The port's inbound queue was full; the frame was dropped.
    #[error("audio queue overflow")]
    AudioQueueOverflow,

    /// The ring buffer was at `CAP`; the frame was dropped by admission control.
    #[error("admission drop: ring at capacity")]
    AdmissionDrop,

    /// The first `onFrameRequested` callback did not arrive within the barrier timeout.
    #[error("first frame requested barrier timed out")]
    FirstFrameTimeout,

    /// The realtime session transport failed to connect or was closed unexpectedly.
    #[error("session transport error: {0}")]
    Transport(String),

    /// A call-lifecycle transition was attempted from an invalid state.
    #[error("invalid call state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        /// State the call was in.
        from: crate::call::CallState,
        /// State the caller attempted to transition to.
        to: crate::call::CallState,
    },
}

impl Error {
    /// True for the well-known "already terminated" status that teardown demotes to debug.
    pub fn is_already_terminated(&self) -> bool {
        matches!(self, Error::SessionAlreadyTerminated)
    }
}
