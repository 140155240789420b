use std::time::Instant;

use ndarray::{Array4, IntoDimension, Ix4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{NoisePredictor, PipelineError, PipelineInput};
use crate::config::DdimConfig;
use crate::noise::{generate_noise, seeded_noise};
use crate::schedulers::Ddim;

#[derive(Debug)]
pub struct DenoisingLoop {
    pub steps: usize,
    pub seed: u64,
    pub seeds: Option<Vec<u64>>,
    pub eta: f32,
    pub config: DdimConfig,
    pub input: PipelineInput,
}

impl DenoisingLoop {
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_seeds(mut self, seeds: Vec<u64>) -> Self {
        self.seeds = Some(seeds);
        self
    }

    pub fn with_eta(mut self, eta: f32) -> Self {
        self.eta = eta;
        self
    }

    pub fn with_config(mut self, config: DdimConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_latent_shape(mut self, shape: [usize; 4]) -> Self {
        self.input = PipelineInput::EmptyLatent { shape };
        self
    }

    pub fn with_input_latents(mut self, latents: Array4<f32>, strength: f64) -> Self {
        self.input = PipelineInput::Latents { latents, strength };
        self
    }

    pub fn execute(&self, predictor: &mut impl NoisePredictor) -> Result<Array4<f32>, PipelineError> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let scheduler = Ddim::new(self.steps, &self.config)?;

        let (mut latents, start) = match &self.input {
            &PipelineInput::EmptyLatent { shape } => {
                (self.initial_noise(shape.into_dimension(), &mut rng)?, 0)
            }
            PipelineInput::Latents { latents, strength } => {
                let start = scheduler.cutoff_index(*strength)?;
                if start == scheduler.len() {
                    debug!(strength, "strength leaves no steps to run");
                    return Ok(latents.clone());
                }
                let eps = self.initial_noise(latents.raw_dim(), &mut rng)?;
                (scheduler.add_noise(latents.view(), eps.view(), start)?, start)
            }
        };

        let now = Instant::now();

        for i in start..scheduler.len() {
            let timestep = scheduler.timesteps()[i];
            debug!(
                step = i,
                steps = scheduler.len(),
                timestep,
                elapsed = now.elapsed().as_secs_f32(),
                "denoising"
            );

            let pred_noise = predictor
                .predict(latents.view(), timestep, i)
                .map_err(|err| PipelineError::Prediction {
                    index: i,
                    source: err.into(),
                })?;
            if pred_noise.dim() != latents.dim() {
                return Err(PipelineError::PredictionShape {
                    index: i,
                    expected: latents.dim(),
                    found: pred_noise.dim(),
                });
            }
            latents = scheduler.step(pred_noise.view(), latents.view(), i, self.eta, &mut rng)?;
        }

        Ok(latents)
    }

    fn initial_noise(&self, shape: Ix4, rng: &mut impl Rng) -> Result<Array4<f32>, PipelineError> {
        let Some(seeds) = &self.seeds else {
            return Ok(generate_noise(shape, rng));
        };
        if seeds.len() != shape[0] {
            return Err(PipelineError::SeedCount {
                seeds: seeds.len(),
                batch: shape[0],
            });
        }
        Ok(seeded_noise((shape[1], shape[2], shape[3]), seeds)?)
    }
}

impl Default for DenoisingLoop {
    fn default() -> Self {
        Self {
            steps: 50,
            seed: 0,
            seeds: None,
            eta: 0.,
            config: DdimConfig::default(),
            input: PipelineInput::EmptyLatent {
                shape: [1, 4, 64, 64],
            },
        }
    }
}
