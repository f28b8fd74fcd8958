use thiserror::Error;

/// Main error type for the recovery engine
///
/// Algorithmic failures (`InsufficientData`, `Inconclusive`,
/// `StructuralViolation`) describe a unit that produced no confident answer;
/// callers degrade them to flagged low-confidence records. `InvalidInput`
/// halts processing of the affected unit.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Insufficient data for {what}: need {needed}, got {got}")]
    InsufficientData {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("Inconclusive: best hypothesis {best} reached confidence {confidence}, {required} required")]
    Inconclusive {
        best: u32,
        confidence: u8,
        required: u8,
    },

    #[error("Structural violation in {stage}: score {before} before correction, {after} after")]
    StructuralViolation {
        stage: &'static str,
        before: i64,
        after: i64,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Integrity check failed for {key}: expected {expected}, computed {actual}")]
    Integrity {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory mapping error: {0}")]
    Mmap(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RecoveryError {
    /// True for the failure classes that only lower confidence of a unit
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            RecoveryError::InsufficientData { .. }
                | RecoveryError::Inconclusive { .. }
                | RecoveryError::StructuralViolation { .. }
        )
    }
}

/// Result type alias for recovery operations
pub type Result<T> = std::result::Result<T, RecoveryError>;
