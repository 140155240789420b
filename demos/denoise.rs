use std::error::Error as StdError;

use ddim_core::attention;
use ddim_core::pipelines::{DenoisingLoop, NoisePredictor};
use ndarray::{Array4, ArrayView4};
use tracing_subscriber::EnvFilter;

// Stand-in for a real network: self-attention across spatial positions.
struct SpatialMixer {
    chunk_size: Option<usize>,
}

impl NoisePredictor for SpatialMixer {
    type Error = Box<dyn StdError + Send + Sync>;

    fn predict(
        &mut self,
        latents: ArrayView4<'_, f32>,
        _timestep: usize,
        _index: usize,
    ) -> Result<Array4<f32>, Self::Error> {
        let (batch, channels, height, width) = latents.dim();
        let tokens = latents
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned()
            .into_shape((batch, height * width, channels))?;
        let query = &tokens / (channels as f32).sqrt();

        let mixed = attention(query.view(), tokens.view(), tokens.view(), self.chunk_size)?;
        let noise = mixed
            .into_shape((batch, height, width, channels))?
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned();
        Ok(noise * 0.1)
    }
}

fn main() -> Result<(), Box<dyn StdError + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let latents = DenoisingLoop::default()
        .with_steps(30)
        .with_eta(0.5)
        .with_seed(rand::random())
        .with_latent_shape([2, 4, 16, 16])
        .execute(&mut SpatialMixer {
            chunk_size: Some(1),
        })?;

    let mean = latents.mean().unwrap_or_default();
    let std = latents.std(0.);
    println!("final latents {:?}: mean {mean:.4}, std {std:.4}", latents.dim());
    Ok(())
}
