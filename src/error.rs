use thiserror::Error;

/// Coarse classification of [`AllocError`].
///
/// Out of memory and invalid arguments are ordinary failures the caller is
/// expected to handle. Programming errors mean the caller broke the
/// allocator's contract (double free, use before `init`, ...); they are
/// detected through header validation and reported instead of corrupting
/// the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfMemory,
    InvalidArgument,
    ProgrammingError,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("out of memory: could not obtain {size} bytes from the operating system")]
    OutOfMemory { size: usize },

    #[error("alignment {0} is not a power of two")]
    BadAlignment(usize),

    #[error("alignment {align} exceeds the maximum supported alignment of {max}")]
    AlignmentTooLarge { align: usize, max: usize },

    #[error("size overflow computing {count} * {size}")]
    SizeOverflow { count: usize, size: usize },

    #[error("double free of {0:#x}")]
    DoubleFree(usize),

    #[error("{0:#x} was not allocated by this allocator")]
    ForeignPointer(usize),

    #[error("allocator is not initialized")]
    NotInitialized,

    #[error("allocator is already initialized")]
    AlreadyInitialized,

    #[error("operating system refused to unmap {len} bytes at {addr:#x}")]
    UnmapFailed { addr: usize, len: usize },

    #[error("heap metadata corrupted at {addr:#x}: {reason}")]
    Corrupted { addr: usize, reason: &'static str },
}

impl AllocError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::BadAlignment(_) | Self::AlignmentTooLarge { .. } | Self::SizeOverflow { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::DoubleFree(_)
            | Self::ForeignPointer(_)
            | Self::NotInitialized
            | Self::AlreadyInitialized
            | Self::UnmapFailed { .. }
            | Self::Corrupted { .. } => ErrorKind::ProgrammingError,
        }
    }
}

pub type Result<T, E = AllocError> = std::result::Result<T, E>;
