use thiserror::Error;

/// Canonical error codes shared by in-process and subprocess execution
/// (spec §7). The integer value doubles as the subprocess exit code, so
/// reordering these variants changes wire behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0,
    GeneralError = 1,
    IoError = 2,
    OomError = 3,
    TimeoutError = 4,
    ValidationError = 5,
    ResourceLimitError = 6,
    CalibrationError = 7,
    ConversionError = 8,
    DatabaseError = 9,
    SubprocessError = 10,
}

impl ErrorCode {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Success => "Completed successfully",
            Self::GeneralError => "Unspecified error",
            Self::IoError => "File I/O failure",
            Self::OomError => "Out of memory",
            Self::TimeoutError => "Execution timeout exceeded",
            Self::ValidationError => "Input validation failed",
            Self::ResourceLimitError => "Resource limit exceeded",
            Self::CalibrationError => "Calibration data missing or invalid",
            Self::ConversionError => "UVH5 to MS conversion failed",
            Self::DatabaseError => "Database operation failed",
            Self::SubprocessError => "Subprocess execution failed",
        }
    }

    /// Map a subprocess return code back to its canonical error code
    /// (spec §7). `-9` (SIGKILL) is treated as an OOM kill; other negative
    /// codes indicate the process died to a signal the harness doesn't
    /// otherwise recognize.
    pub fn from_return_code(code: i32) -> Self {
        if (0..=10).contains(&code) {
            return match code {
                0 => Self::Success,
                1 => Self::GeneralError,
                2 => Self::IoError,
                3 => Self::OomError,
                4 => Self::TimeoutError,
                5 => Self::ValidationError,
                6 => Self::ResourceLimitError,
                7 => Self::CalibrationError,
                8 => Self::ConversionError,
                9 => Self::DatabaseError,
                _ => Self::SubprocessError,
            };
        }
        if code == -9 {
            return Self::OomError;
        }
        if code < 0 {
            return Self::SubprocessError;
        }
        Self::GeneralError
    }
}

/// Errors produced by pipeline stages, carrying a canonical [`ErrorCode`]
/// so in-process and subprocess execution report identically (spec §4.D,
/// §7).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("execution timed out: {0}")]
    Timeout(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("calibration error: {0}")]
    Calibration(String),

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("subprocess error: {0}")]
    Subprocess(String),

    #[error("{0}")]
    General(String),
}

impl PipelineError {
    /// Map this error to its canonical [`ErrorCode`], mirroring the
    /// substring-based classification the pipeline's Python predecessor
    /// applies to bare exceptions (spec §7): our own typed variants map
    /// directly, everything else falls through a message-keyword scan
    /// before defaulting to `GeneralError`.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Timeout(_) => ErrorCode::TimeoutError,
            Self::ResourceLimit(_) => ErrorCode::ResourceLimitError,
            Self::Calibration(_) => ErrorCode::CalibrationError,
            Self::Conversion(_) => ErrorCode::ConversionError,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Subprocess(_) => ErrorCode::SubprocessError,
            Self::General(msg) => classify_message(msg),
        }
    }

    /// Build a [`PipelineError`] from a free-form message, using the same
    /// keyword classification `code()` falls back to for `General`.
    pub fn from_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match classify_message(&msg) {
            ErrorCode::CalibrationError => Self::Calibration(msg),
            ErrorCode::ConversionError => Self::Conversion(msg),
            ErrorCode::DatabaseError => Self::Database(sqlx::Error::Protocol(msg)),
            ErrorCode::ResourceLimitError => Self::ResourceLimit(msg),
            _ => Self::General(msg),
        }
    }
}

fn classify_message(msg: &str) -> ErrorCode {
    let lower = msg.to_lowercase();
    if lower.contains("timeout") {
        return ErrorCode::TimeoutError;
    }
    if lower.contains("calibration") || lower.contains("caltable") {
        return ErrorCode::CalibrationError;
    }
    if lower.contains("conversion") || lower.contains("uvh5") || lower.contains("measurement set")
    {
        return ErrorCode::ConversionError;
    }
    if lower.contains("database") || lower.contains("sqlite") {
        return ErrorCode::DatabaseError;
    }
    if lower.contains("resource") || lower.contains("limit") || lower.contains("rlimit") {
        return ErrorCode::ResourceLimitError;
    }
    ErrorCode::GeneralError
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_code_round_trips_for_known_codes() {
        for code in 0..=10u8 {
            let mapped = ErrorCode::from_return_code(code as i32);
            assert_eq!(mapped as u8, code);
        }
    }

    #[test]
    fn sigkill_maps_to_oom() {
        assert_eq!(ErrorCode::from_return_code(-9), ErrorCode::OomError);
    }

    #[test]
    fn unknown_negative_maps_to_subprocess_error() {
        assert_eq!(ErrorCode::from_return_code(-15), ErrorCode::SubprocessError);
    }

    #[test]
    fn unknown_positive_maps_to_general_error() {
        assert_eq!(ErrorCode::from_return_code(42), ErrorCode::GeneralError);
    }

    #[test]
    fn message_keyword_classification() {
        assert_eq!(
            PipelineError::from_message("caltable missing").code(),
            ErrorCode::CalibrationError
        );
        assert_eq!(
            PipelineError::from_message("uvh5 conversion failed").code(),
            ErrorCode::ConversionError
        );
        assert_eq!(
            PipelineError::from_message("sqlite is locked").code(),
            ErrorCode::DatabaseError
        );
        assert_eq!(
            PipelineError::from_message("rlimit exceeded").code(),
            ErrorCode::ResourceLimitError
        );
        assert_eq!(
            PipelineError::from_message("something odd happened").code(),
            ErrorCode::GeneralError
        );
    }
}
