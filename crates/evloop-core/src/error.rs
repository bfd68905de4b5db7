use std::{error::Error as StdError, sync::Arc};

use thiserror::Error;

/// Failures surfaced through futures, loop construction and loop shutdown.
///
/// `Clone` because a single completed result is handed to every observer of a future.
#[derive(Error, Debug, Clone)]
pub enum LoopError {
    #[error("cancelled")]
    Cancelled,
    #[error("event loop is shut down")]
    Shutdown,
    #[error("promise dropped without being completed")]
    BrokenPromise,
    #[error("invalid loop configuration: {0}")]
    Config(String),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("cannot shut a group down from one of its own loop threads")]
    ShutdownFromLoop,
    #[error("the shared singleton group cannot be shut down")]
    SingletonShutdown,
    #[error(transparent)]
    Other(Arc<dyn StdError + Send + Sync>),
}

impl LoopError {
    /// Wraps an arbitrary error, e.g. a domain failure raised by an external handler.
    pub fn other<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        LoopError::Other(Arc::new(err))
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoopError::Cancelled)
    }

    /// Downcasts the wrapped error of [`LoopError::Other`].
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            LoopError::Other(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LoopError {
    fn from(e: std::io::Error) -> Self {
        LoopError::Spawn(e.to_string())
    }
}
