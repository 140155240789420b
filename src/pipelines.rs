use std::error::Error as StdError;

use ndarray::{Array4, ArrayView4};
use thiserror::Error;

use crate::schedulers::SchedulerError;

mod denoise;
pub use denoise::DenoisingLoop;

pub trait NoisePredictor {
    type Error: Into<Box<dyn StdError + Send + Sync>>;

    fn predict(
        &mut self,
        latents: ArrayView4<'_, f32>,
        timestep: usize,
        index: usize,
    ) -> Result<Array4<f32>, Self::Error>;
}

#[derive(Debug)]
pub enum PipelineInput {
    EmptyLatent { shape: [usize; 4] },
    Latents { latents: Array4<f32>, strength: f64 },
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("noise prediction failed at step {index}: {source}")]
    Prediction {
        index: usize,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("noise prediction at step {index} has shape {found:?}, latents have {expected:?}")]
    PredictionShape {
        index: usize,
        expected: (usize, usize, usize, usize),
        found: (usize, usize, usize, usize),
    },
    #[error("got {seeds} seeds for a batch of {batch}")]
    SeedCount { seeds: usize, batch: usize },
    #[error("unexpected tensor shape: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
}
