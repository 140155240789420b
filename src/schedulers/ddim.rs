use ndarray::{Array, Array1, ArrayView, ArrayView1, Axis, Dimension, RemoveAxis, Zip};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use super::{SchedulerError, StepIndex};
use crate::config::{DdimConfig, Precision};

// Rounding residue allowed below zero before a variance term counts as negative.
const VARIANCE_TOLERANCE: f64 = 1e-6;
// Decimal strengths like 0.9 are not exact in binary; products this close to an integer are that integer.
const CUTOFF_EPSILON: f64 = 1e-9;

// https://arxiv.org/abs/2010.02502
// Index 0 is the noisiest entry; the tables carry one extra terminal entry with alpha_bar == 1.
#[derive(Debug, Clone)]
pub struct Ddim {
    alpha_bar: Array1<f32>,
    one_minus_alpha_bar: Array1<f32>,
    sigma: Array1<f32>,
    sqrt_alpha_bar: Array1<f32>,
    sqrt_one_minus_alpha_bar: Array1<f32>,
    // variance terms are formed before rounding to the target precision
    exact_one_minus_alpha_bar: Array1<f64>,
    exact_sigma: Array1<f64>,
    timesteps: Array1<usize>,
    precision: Precision,
    steps: usize,
}

impl Ddim {
    pub fn new(steps: usize, config: &DdimConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let trained_steps = config.trained_steps;
        if steps == 0 {
            return Err(SchedulerError::NoSteps);
        }
        if steps > trained_steps {
            return Err(SchedulerError::TooManySteps {
                steps,
                trained_steps,
            });
        }

        let root = config.power.recip();
        let mut betas = Array1::linspace(
            config.beta_start.powf(root),
            config.beta_end.powf(root),
            trained_steps,
        );
        betas.mapv_inplace(|beta| beta.powf(config.power));

        let mut alpha_bar_full: Array1<f64> = betas
            .iter()
            .scan(1.0, |state, &beta| {
                *state *= 1. - beta;
                Some(*state)
            })
            .collect();
        let max = alpha_bar_full.fold(f64::MIN, |acc, &x| acc.max(x));
        alpha_bar_full /= max;

        let timesteps = select_timesteps(steps, trained_steps);
        let alpha_bar = timesteps.mapv(|t| alpha_bar_full[t]);
        let sigma = ddim_sigma(&alpha_bar)?;

        debug!(
            steps,
            trained_steps,
            precision = ?config.precision,
            first_timestep = timesteps[0],
            "built ddim schedule"
        );

        Ok(Self::from_tables(alpha_bar, sigma, timesteps, config.precision))
    }

    fn from_tables(
        alpha_bar: Array1<f64>,
        sigma: Array1<f64>,
        timesteps: Array1<usize>,
        precision: Precision,
    ) -> Self {
        let one_minus_alpha_bar = alpha_bar.mapv(|x| 1. - x);
        let quantize = |table: &Array1<f64>| table.mapv(|x| precision.quantize(x));

        Self {
            alpha_bar: quantize(&alpha_bar),
            one_minus_alpha_bar: quantize(&one_minus_alpha_bar),
            sigma: quantize(&sigma),
            sqrt_alpha_bar: quantize(&alpha_bar.mapv(f64::sqrt)),
            sqrt_one_minus_alpha_bar: quantize(&one_minus_alpha_bar.mapv(f64::sqrt)),
            exact_one_minus_alpha_bar: one_minus_alpha_bar,
            exact_sigma: sigma,
            steps: timesteps.len() - 1,
            timesteps,
            precision,
        }
    }

    #[inline]
    pub fn with_steps(steps: usize) -> Result<Self, SchedulerError> {
        Self::new(steps, &DdimConfig::default())
    }

    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.steps
    }

    #[inline]
    pub fn alpha_bar(&self) -> ArrayView1<'_, f32> {
        self.alpha_bar.view()
    }

    #[inline]
    pub fn one_minus_alpha_bar(&self) -> ArrayView1<'_, f32> {
        self.one_minus_alpha_bar.view()
    }

    #[inline]
    pub fn sigma(&self) -> ArrayView1<'_, f32> {
        self.sigma.view()
    }

    #[inline]
    pub fn timesteps(&self) -> ArrayView1<'_, usize> {
        self.timesteps.view()
    }

    #[inline]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    // eq (12); nothing is drawn from `rng` when eta == 0
    pub fn step<'i, D, R>(
        &self,
        pred_noise: ArrayView<'_, f32, D>,
        latents: ArrayView<'_, f32, D>,
        index: impl Into<StepIndex<'i>>,
        eta: f32,
        rng: &mut R,
    ) -> Result<Array<f32, D>, SchedulerError>
    where
        D: RemoveAxis,
        R: Rng + ?Sized,
    {
        check_shapes(&latents, &pred_noise)?;
        if !(0. ..=1.).contains(&eta) {
            return Err(SchedulerError::InvalidEta(eta));
        }

        match index.into() {
            StepIndex::Scalar(i) => self.step_view(pred_noise, latents, i, eta, rng),
            StepIndex::Batched(indices) => {
                map_items(pred_noise, latents, indices, |pred_noise, latents, i| {
                    self.step_view(pred_noise, latents, i, eta, &mut *rng)
                })
            }
        }
    }

    // eq (4)
    pub fn add_noise<'i, D>(
        &self,
        latents: ArrayView<'_, f32, D>,
        eps: ArrayView<'_, f32, D>,
        index: impl Into<StepIndex<'i>>,
    ) -> Result<Array<f32, D>, SchedulerError>
    where
        D: RemoveAxis,
    {
        check_shapes(&latents, &eps)?;

        match index.into() {
            StepIndex::Scalar(i) => self.add_noise_view(latents, eps, i),
            StepIndex::Batched(indices) => map_items(latents, eps, indices, |latents, eps, i| {
                self.add_noise_view(latents, eps, i)
            }),
        }
    }

    pub fn pred_original<'i, D>(
        &self,
        pred_noise: ArrayView<'_, f32, D>,
        latents: ArrayView<'_, f32, D>,
        index: impl Into<StepIndex<'i>>,
    ) -> Result<Array<f32, D>, SchedulerError>
    where
        D: RemoveAxis,
    {
        check_shapes(&latents, &pred_noise)?;

        match index.into() {
            StepIndex::Scalar(i) => self.pred_original_view(pred_noise, latents, i),
            StepIndex::Batched(indices) => {
                map_items(pred_noise, latents, indices, |pred_noise, latents, i| {
                    self.pred_original_view(pred_noise, latents, i)
                })
            }
        }
    }

    pub fn cutoff_index(&self, strength: f64) -> Result<usize, SchedulerError> {
        if !(strength > 0. && strength <= 1.) {
            return Err(SchedulerError::InvalidStrength(strength));
        }
        let cutoff = self.steps as f64 * (1. - strength);
        let nearest = cutoff.round();
        let cutoff = if (cutoff - nearest).abs() < CUTOFF_EPSILON {
            nearest
        } else {
            cutoff.ceil()
        };
        Ok(cutoff as usize)
    }

    fn check_index(&self, index: usize) -> Result<(), SchedulerError> {
        if index < self.steps {
            Ok(())
        } else {
            Err(SchedulerError::IndexOutOfRange {
                index,
                steps: self.steps,
            })
        }
    }

    fn coefficients(&self, i: usize, eta: f32) -> Result<StepCoefficients, SchedulerError> {
        self.check_index(i)?;

        let noise_scale = self.exact_sigma[i] * f64::from(eta);
        let variance = self.exact_one_minus_alpha_bar[i + 1] - noise_scale.powi(2);
        if variance < -VARIANCE_TOLERANCE {
            return Err(SchedulerError::NegativeVariance {
                index: i,
                value: variance as f32,
            });
        }

        Ok(StepCoefficients {
            sqrt_alpha_bar: self.sqrt_alpha_bar[i],
            sqrt_one_minus_alpha_bar: self.sqrt_one_minus_alpha_bar[i],
            sqrt_alpha_bar_next: self.sqrt_alpha_bar[i + 1],
            direction: self.precision.quantize(variance.max(0.).sqrt()),
            noise_scale: self.precision.quantize(noise_scale),
        })
    }

    fn step_view<E, R>(
        &self,
        pred_noise: ArrayView<'_, f32, E>,
        latents: ArrayView<'_, f32, E>,
        i: usize,
        eta: f32,
        rng: &mut R,
    ) -> Result<Array<f32, E>, SchedulerError>
    where
        E: Dimension,
        R: Rng + ?Sized,
    {
        let c = self.coefficients(i, eta)?;

        let mut result = Zip::from(&latents)
            .and(&pred_noise)
            .map_collect(|&latent, &noise| {
                let pred_latent =
                    (latent - c.sqrt_one_minus_alpha_bar * noise) / c.sqrt_alpha_bar;
                pred_latent * c.sqrt_alpha_bar_next + c.direction * noise
            });
        if c.noise_scale > 0. {
            result.mapv_inplace(|x| x + c.noise_scale * rng.sample::<f32, _>(StandardNormal));
        }
        Ok(result)
    }

    fn add_noise_view<E: Dimension>(
        &self,
        latents: ArrayView<'_, f32, E>,
        eps: ArrayView<'_, f32, E>,
        i: usize,
    ) -> Result<Array<f32, E>, SchedulerError> {
        self.check_index(i)?;
        let signal = self.sqrt_alpha_bar[i];
        let noise = self.sqrt_one_minus_alpha_bar[i];
        Ok(Zip::from(&latents)
            .and(&eps)
            .map_collect(|&x, &e| x * signal + e * noise))
    }

    fn pred_original_view<E: Dimension>(
        &self,
        pred_noise: ArrayView<'_, f32, E>,
        latents: ArrayView<'_, f32, E>,
        i: usize,
    ) -> Result<Array<f32, E>, SchedulerError> {
        self.check_index(i)?;
        let signal = self.sqrt_alpha_bar[i];
        let noise = self.sqrt_one_minus_alpha_bar[i];
        Ok(Zip::from(&latents)
            .and(&pred_noise)
            .map_collect(|&x, &e| (x - noise * e) / signal))
    }
}

#[derive(Debug, Clone, Copy)]
struct StepCoefficients {
    sqrt_alpha_bar: f32,
    sqrt_one_minus_alpha_bar: f32,
    sqrt_alpha_bar_next: f32,
    direction: f32,
    noise_scale: f32,
}

// `steps + 1` trained timesteps from the noisiest down to 0, rounded up
fn select_timesteps(steps: usize, trained_steps: usize) -> Array1<usize> {
    let last = trained_steps - 1;
    (0..=steps)
        .map(|j| (((steps - j) * last + steps - 1) / steps).min(last))
        .collect()
}

// eq (16)
fn ddim_sigma(alpha_bar: &Array1<f64>) -> Result<Array1<f64>, SchedulerError> {
    let one_minus_alpha_bar = alpha_bar.mapv(|x| 1. - x);
    (0..alpha_bar.len() - 1)
        .map(|i| {
            if one_minus_alpha_bar[i] == 0. {
                return Ok(0.);
            }
            let value = (one_minus_alpha_bar[i + 1] / one_minus_alpha_bar[i]
                * (1. - alpha_bar[i] / alpha_bar[i + 1]))
                .sqrt();
            if value.is_finite() {
                Ok(value)
            } else {
                Err(SchedulerError::DegenerateSchedule(i))
            }
        })
        .collect()
}

fn check_shapes<D: Dimension>(
    expected: &ArrayView<'_, f32, D>,
    found: &ArrayView<'_, f32, D>,
) -> Result<(), SchedulerError> {
    if expected.shape() == found.shape() {
        Ok(())
    } else {
        Err(SchedulerError::ShapeMismatch {
            expected: expected.shape().to_vec(),
            found: found.shape().to_vec(),
        })
    }
}

fn map_items<D, F>(
    first: ArrayView<'_, f32, D>,
    second: ArrayView<'_, f32, D>,
    indices: &[usize],
    mut f: F,
) -> Result<Array<f32, D>, SchedulerError>
where
    D: RemoveAxis,
    F: FnMut(
        ArrayView<'_, f32, D::Smaller>,
        ArrayView<'_, f32, D::Smaller>,
        usize,
    ) -> Result<Array<f32, D::Smaller>, SchedulerError>,
{
    let batch = first.len_of(Axis(0));
    if indices.len() != batch {
        return Err(SchedulerError::BatchMismatch {
            expected: batch,
            found: indices.len(),
        });
    }

    let mut out = Array::zeros(first.raw_dim());
    for (((mut item, a), b), &i) in out
        .outer_iter_mut()
        .zip(first.outer_iter())
        .zip(second.outer_iter())
        .zip(indices)
    {
        item.assign(&f(a, b, i)?);
    }
    Ok(out)
}
