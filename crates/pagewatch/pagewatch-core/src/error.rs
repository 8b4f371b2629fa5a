use std::io;

/// Engine-level errors, mapped 1:1 onto the C ABI status codes by
/// [`EngineError::code`]. Operations that fail leave no partial state.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine not initialized")]
    NotInitialized,

    #[error("invalid address or size")]
    InvalidAddress,

    #[error("region overlaps an existing region of the same adapter")]
    RegionOverlap,

    #[error("capacity exhausted")]
    OutOfMemory,

    #[error("adapter limit reached")]
    AdapterLimit,

    #[error("page protection failed")]
    ProtectFailed(#[source] io::Error),

    #[error("failed to install fault handler")]
    HandlerInstall(#[source] io::Error),

    #[error("failed to spawn worker thread")]
    WorkerSpawn(#[source] io::Error),

    #[error("not found")]
    NotFound,
}

impl EngineError {
    /// ABI status code for this error.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::NotInitialized => -1,
            EngineError::InvalidAddress | EngineError::RegionOverlap => -2,
            EngineError::OutOfMemory | EngineError::AdapterLimit => -3,
            EngineError::ProtectFailed(_)
            | EngineError::HandlerInstall(_)
            | EngineError::WorkerSpawn(_) => -4,
            EngineError::NotFound => -5,
        }
    }
}

/// Status code for a successful ABI call.
pub const STATUS_OK: i32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_abi() {
        assert_eq!(EngineError::NotInitialized.code(), -1);
        assert_eq!(EngineError::InvalidAddress.code(), -2);
        assert_eq!(EngineError::RegionOverlap.code(), -2);
        assert_eq!(EngineError::OutOfMemory.code(), -3);
        assert_eq!(EngineError::NotFound.code(), -5);
        let io = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(EngineError::ProtectFailed(io).code(), -4);
    }
}
