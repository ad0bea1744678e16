//! Error types for engine operations

use crate::program::ProgramError;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type returned by kernel functions
pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Errors reported by kernel functions during a parallel pass
///
/// Kernels are external to the engine; this is the vocabulary they use to
/// signal failure back through the dispatch loop. The engine records the
/// first kernel error of a pass together with the operation index and the
/// worker that hit it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// Operand outside the kernel's domain (e.g. sqrt of a negative)
    #[error("domain error: {0}")]
    Domain(String),

    /// Division by zero
    #[error("division by zero")]
    DivisionByZero,

    /// The kernel panicked; the panic was caught at the worker boundary
    #[error("kernel panicked: {0}")]
    Panic(String),
}

/// Errors that can occur when configuring or driving the engine
///
/// Three families:
/// - structural errors (caller misuse) are rejected synchronously, before
///   the worker pool is engaged;
/// - kernel errors are raised by exactly one worker during a pass and
///   surfaced after the barrier closes;
/// - resource errors abort the call and leave the pool in its last
///   known-good halted state.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An evaluation or resize is already in progress
    #[error("engine is busy: an evaluation or resize is in progress")]
    PoolBusy,

    /// Requested worker count is unusable
    #[error("invalid thread count: {0} (must be >= 1)")]
    InvalidThreadCount(usize),

    /// The compiled program failed validation
    #[error("program error: {0}")]
    Program(#[from] ProgramError),

    /// The iteration plan disagrees with the program
    #[error("iteration plan mismatch: {0}")]
    PlanMismatch(String),

    /// A binding names a register the program does not declare
    #[error("binding names unknown register r{register}")]
    UnknownRegister { register: u8 },

    /// An input or output register has no bound buffer
    #[error("register r{register} is not bound to a buffer")]
    UnboundRegister { register: u8 },

    /// The same register was bound twice
    #[error("register r{register} bound twice")]
    DuplicateBinding { register: u8 },

    /// A binding's direction does not match the register class
    #[error("register r{register} does not accept {direction} bindings")]
    BindingClass { register: u8, direction: &'static str },

    /// A binding's element size disagrees with the program's declaration
    #[error("itemsize mismatch for r{register}: program declares {expected}, binding has {actual}")]
    ItemsizeMismatch {
        register: u8,
        expected: usize,
        actual: usize,
    },

    /// A bound buffer does not cover the iteration domain
    #[error("buffer bound to r{register} too short: need {needed} elements, have {len}")]
    BufferTooShort {
        register: u8,
        needed: usize,
        len: usize,
    },

    /// A kernel reported an error during the parallel pass
    #[error("kernel error at operation {pc} (worker {worker}): {source}")]
    Kernel {
        pc: usize,
        worker: usize,
        #[source]
        source: KernelError,
    },

    /// Temp arena growth failed
    #[error("temp arena growth failed: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Worker thread creation failed during construction or resize
    #[error("worker thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

impl EngineError {
    /// Flat integer code for this error; success is conventionally `0`.
    ///
    /// Callers that forward results across a language boundary can use the
    /// code instead of matching on the enum. Codes are stable per variant.
    ///
    /// # Example
    ///
    /// ```
    /// use lamina_core::EngineError;
    ///
    /// assert_eq!(EngineError::PoolBusy.code(), -1);
    /// assert_eq!(EngineError::InvalidThreadCount(0).code(), -2);
    /// ```
    pub fn code(&self) -> i32 {
        match self {
            EngineError::PoolBusy => -1,
            EngineError::InvalidThreadCount(_) => -2,
            EngineError::Program(_) => -3,
            EngineError::PlanMismatch(_) => -4,
            EngineError::UnknownRegister { .. } => -5,
            EngineError::UnboundRegister { .. } => -6,
            EngineError::DuplicateBinding { .. } => -7,
            EngineError::BindingClass { .. } => -8,
            EngineError::ItemsizeMismatch { .. } => -9,
            EngineError::BufferTooShort { .. } => -10,
            EngineError::Kernel { .. } => -20,
            EngineError::OutOfMemory { .. } => -30,
            EngineError::Spawn(_) => -31,
        }
    }

    /// Operation index of the failing kernel call, if this is a kernel error.
    pub fn program_counter(&self) -> Option<usize> {
        match self {
            EngineError::Kernel { pc, .. } => Some(*pc),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_error_display() {
        let err = KernelError::Domain("sqrt of negative".to_string());
        assert_eq!(err.to_string(), "domain error: sqrt of negative");

        let err = KernelError::DivisionByZero;
        assert_eq!(err.to_string(), "division by zero");
    }

    #[test]
    fn test_engine_error_codes_distinct() {
        let errors = [
            EngineError::PoolBusy,
            EngineError::InvalidThreadCount(0),
            EngineError::PlanMismatch("x".into()),
            EngineError::UnknownRegister { register: 1 },
            EngineError::UnboundRegister { register: 1 },
            EngineError::DuplicateBinding { register: 1 },
            EngineError::BindingClass {
                register: 1,
                direction: "input",
            },
            EngineError::ItemsizeMismatch {
                register: 1,
                expected: 8,
                actual: 4,
            },
            EngineError::BufferTooShort {
                register: 1,
                needed: 10,
                len: 5,
            },
            EngineError::Kernel {
                pc: 0,
                worker: 0,
                source: KernelError::DivisionByZero,
            },
            EngineError::OutOfMemory { requested: 1 },
        ];

        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|&c| c < 0));
    }

    #[test]
    fn test_program_counter_accessor() {
        let err = EngineError::Kernel {
            pc: 7,
            worker: 2,
            source: KernelError::DivisionByZero,
        };
        assert_eq!(err.program_counter(), Some(7));
        assert_eq!(EngineError::PoolBusy.program_counter(), None);
    }
}
