use super::mixer::Status;
use thiserror::Error;

pub const ASE_OK: i32 = 0;
pub const ASE_SUCCESS: i32 = 0x3f48_47a0;
pub const ASE_NOT_PRESENT: i32 = -1000;
pub const ASE_HW_MALFUNCTION: i32 = -999;
pub const ASE_INVALID_PARAMETER: i32 = -998;
pub const ASE_INVALID_MODE: i32 = -997;
pub const ASE_SP_NOT_ADVANCING: i32 = -996;
pub const ASE_NO_CLOCK: i32 = -995;
pub const ASE_NO_MEMORY: i32 = -994;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer underflow")]
    Underflow,
    #[error("buffer overflow")]
    Overflow,
    #[error("buffer is read-only")]
    ReadOnly,
    #[error("capacity {capacity} is not a multiple of granularity {granularity}")]
    Granularity { capacity: usize, granularity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AsioError {
    #[error("hardware input or output is not present or available")]
    NotPresent,
    #[error("hardware is malfunctioning")]
    HwMalfunction,
    #[error("input parameter invalid")]
    InvalidParameter,
    #[error("hardware is in a bad mode or used in a bad mode")]
    InvalidMode,
    #[error("hardware is not running when sample position is inquired")]
    SpNotAdvancing,
    #[error("sample clock or rate cannot be determined or is not present")]
    NoClock,
    #[error("not enough memory for completing the request")]
    NoMemory,
    #[error("unknown ASIO error code {0}")]
    Unknown(i32),
}

impl AsioError {
    pub fn check(code: i32) -> Result<(), AsioError> {
        match code {
            ASE_OK | ASE_SUCCESS => Ok(()),
            other => Err(Self::from_code(other)),
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            ASE_NOT_PRESENT => Self::NotPresent,
            ASE_HW_MALFUNCTION => Self::HwMalfunction,
            ASE_INVALID_PARAMETER => Self::InvalidParameter,
            ASE_INVALID_MODE => Self::InvalidMode,
            ASE_SP_NOT_ADVANCING => Self::SpNotAdvancing,
            ASE_NO_CLOCK => Self::NoClock,
            ASE_NO_MEMORY => Self::NoMemory,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::NotPresent => ASE_NOT_PRESENT,
            Self::HwMalfunction => ASE_HW_MALFUNCTION,
            Self::InvalidParameter => ASE_INVALID_PARAMETER,
            Self::InvalidMode => ASE_INVALID_MODE,
            Self::SpNotAdvancing => ASE_SP_NOT_ADVANCING,
            Self::NoClock => ASE_NO_CLOCK,
            Self::NoMemory => ASE_NO_MEMORY,
            Self::Unknown(code) => *code,
        }
    }

    /// Errors caused by the current hardware state rather than the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::HwMalfunction | Self::NoClock | Self::SpNotAdvancing
        )
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("ASIO {operation} failed: {source}")]
    Asio {
        operation: &'static str,
        #[source]
        source: AsioError,
    },
    #[error("another ASIO driver is currently active: {0}")]
    AnotherDriverActive(String),
    #[error("unable to load ASIO driver '{0}'")]
    LoadFailed(String),
    #[error("line not supported: {0}")]
    LineUnavailable(String),
    #[error("ASIO is already activated with another line")]
    AlreadyActive,
    #[error("audio format not supported: {0}")]
    UnsupportedFormat(String),
    #[error("{0} bytes is not an integral number of sample frames")]
    PartialFrame(usize),
    #[error("{0} is not supported on this line direction")]
    WrongDirection(&'static str),
    #[error("driver is {actual:?}, operation requires {required:?}")]
    InvalidState { required: Status, actual: Status },
    #[error("mixer has been released")]
    MixerGone,
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("failed to load ASIO host library: {0}")]
    Library(#[from] libloading::Error),
}

impl DriverError {
    pub fn asio(operation: &'static str, source: AsioError) -> Self {
        Self::Asio { operation, source }
    }

    pub fn asio_code(&self) -> Option<AsioError> {
        match self {
            Self::Asio { source, .. } => Some(*source),
            _ => None,
        }
    }
}
