use std::io;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io failure")]
    Io(#[from] io::Error),

    #[error("not a value store file (bad magic)")]
    BadMagic,

    #[error("unsupported value store version {found}")]
    BadVersion { found: u32 },

    #[error("header checksum mismatch")]
    BadChecksum,

    #[error("store file is inconsistent: {0}")]
    Corrupt(&'static str),

    #[error("key exceeds the {max}-byte limit", max = crate::layout::KEY_MAX)]
    KeyTooLong,

    #[error("value of {len} bytes exceeds the per-record cap of {max}")]
    ValueTooLarge { len: usize, max: usize },

    #[error("key not found")]
    NotFound,

    #[error("output buffer too small ({needed} bytes required)")]
    Truncated { needed: usize },

    #[error("store cannot grow any further")]
    NoSpace,
}

impl StoreError {
    /// True for the open-time failures that mean the file itself is
    /// unusable (the engine then runs without persistent spill).
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::BadMagic
                | StoreError::BadVersion { .. }
                | StoreError::BadChecksum
                | StoreError::Corrupt(_)
        )
    }
}
