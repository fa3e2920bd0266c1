//! Error types for the corio runtime

use core::fmt;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RtError>;

/// Errors that can occur in runtime operations
#[derive(Debug)]
pub enum RtError {
    /// An IO thread registered past the pipeline table
    IoThreadLimit,

    /// io_uring setup failed
    RingSetup(std::io::Error),

    /// Buffer/file registration with the ring failed
    Register(std::io::Error),

    /// Spawning an OS thread failed
    ThreadSpawn(std::io::Error),
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::IoThreadLimit => write!(f, "too many threads submitting IO"),
            RtError::RingSetup(e) => write!(f, "io_uring setup failed: {}", e),
            RtError::Register(e) => write!(f, "io_uring register failed: {}", e),
            RtError::ThreadSpawn(e) => write!(f, "thread spawn failed: {}", e),
        }
    }
}

impl std::error::Error for RtError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RtError::RingSetup(e) | RtError::Register(e) | RtError::ThreadSpawn(e) => Some(e),
            RtError::IoThreadLimit => None,
        }
    }
}
