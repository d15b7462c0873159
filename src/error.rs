use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProfileError>;

/// Decode stage reported alongside [`ProfileError::BadData`] so a corrupt or
/// truncated profile can be attributed to the region that failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Header,
    LineHeader,
    Methods,
    Classes,
    Bitmap,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadStage::Header => "header",
            LoadStage::LineHeader => "line header",
            LoadStage::Methods => "methods",
            LoadStage::Classes => "classes",
            LoadStage::Bitmap => "bitmap",
        })
    }
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile already contains data")]
    WouldOverwrite,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("profile version mismatch (found {found:?})")]
    VersionMismatch { found: [u8; 4] },

    #[error("bad profile data at {stage}: {reason}")]
    BadData {
        stage: LoadStage,
        reason: &'static str,
    },

    #[error("profile too large: {len} bytes exceeds limit of {max}")]
    TooLarge { len: u64, max: u64 },

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("profile merge conflict: {0}")]
    MergeConflict(&'static str),

    #[error("profile archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl ProfileError {
    pub(crate) fn bad(stage: LoadStage, reason: &'static str) -> Self {
        ProfileError::BadData { stage, reason }
    }

    /// Re-tag an error with the decode stage it surfaced in. Short reads from
    /// the in-memory payload arrive as `UnexpectedEof` and become `BadData`;
    /// genuine device errors stay `Io`.
    pub(crate) fn at_stage(self, stage: LoadStage) -> Self {
        match self {
            ProfileError::Io(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                ProfileError::bad(stage, "unexpected end of data")
            }
            ProfileError::BadData { reason, .. } => ProfileError::BadData { stage, reason },
            other => other,
        }
    }
}
