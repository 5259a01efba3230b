//! Result codes shared by the recording, submission and completion paths.

/// Errors reported by the engine.
///
/// Recording operations check for these before appending anything, so a
/// failed call never leaves a partially recorded command behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// A malformed argument or command sequence.
    #[error("invalid value")]
    InvalidValue,
    /// A device queue rejected a finalize or dispatch.
    #[error("invalid queue")]
    InvalidQueue,
    /// The fence has not signaled yet.
    #[error("fence not ready")]
    FenceNotReady,
    /// The work guarded by the fence failed on the device.
    #[error("fence failure")]
    FenceFailure,
    /// The operation needs a feature that is not compiled in.
    #[error("feature unsupported")]
    FeatureUnsupported,
    /// A wait exhausted its time budget.
    #[error("timeout")]
    Timeout,
    /// The worker thread of a device queue has exited.
    #[error("device lost")]
    DeviceLost,
}

impl Error {
    /// Not ready is an expected, transient condition rather than a failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::FenceNotReady | Self::Timeout)
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}
