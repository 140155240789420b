use thiserror::Error;

use crate::config::ConfigError;

mod ddim;

pub use ddim::Ddim;

// `Batched` holds one index per item along axis 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepIndex<'a> {
    Scalar(usize),
    Batched(&'a [usize]),
}

impl From<usize> for StepIndex<'_> {
    #[inline]
    fn from(value: usize) -> Self {
        Self::Scalar(value)
    }
}

impl<'a> From<&'a [usize]> for StepIndex<'a> {
    #[inline]
    fn from(value: &'a [usize]) -> Self {
        Self::Batched(value)
    }
}

impl<'a, const N: usize> From<&'a [usize; N]> for StepIndex<'a> {
    #[inline]
    fn from(value: &'a [usize; N]) -> Self {
        Self::Batched(value)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    #[error("invalid schedule config: {0}")]
    Config(#[from] ConfigError),
    #[error("a schedule needs at least one step")]
    NoSteps,
    #[error("requested {steps} steps but the trained schedule only has {trained_steps}")]
    TooManySteps { steps: usize, trained_steps: usize },
    #[error("non-finite schedule coefficient at index {0}")]
    DegenerateSchedule(usize),
    #[error("step index {index} out of range for a {steps}-step schedule")]
    IndexOutOfRange { index: usize, steps: usize },
    #[error("expected one step index per batch item ({expected}), got {found}")]
    BatchMismatch { expected: usize, found: usize },
    #[error("tensor shape {found:?} does not match {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("eta must lie in [0, 1], got {0}")]
    InvalidEta(f32),
    #[error("strength must lie in (0, 1], got {0}")]
    InvalidStrength(f64),
    #[error("negative variance {value} at step {index}, schedule and eta are incompatible")]
    NegativeVariance { index: usize, value: f32 },
}
