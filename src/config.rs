use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    #[inline]
    pub fn quantize(self, value: f64) -> f32 {
        match self {
            Self::Fp32 => value as f32,
            Self::Fp16 => f16::from_f64(value).to_f32(),
            Self::Bf16 => bf16::from_f64(value).to_f32(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdimConfig {
    pub trained_steps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub power: f64,
    pub precision: Precision,
}

impl DdimConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_trained_steps(mut self, trained_steps: usize) -> Self {
        self.trained_steps = trained_steps;
        self
    }

    pub fn with_betas(mut self, beta_start: f64, beta_end: f64) -> Self {
        self.beta_start = beta_start;
        self.beta_end = beta_end;
        self
    }

    pub fn with_power(mut self, power: f64) -> Self {
        self.power = power;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trained_steps == 0 {
            return Err(ConfigError::NoTrainedSteps);
        }
        for (name, beta) in [("beta_start", self.beta_start), ("beta_end", self.beta_end)] {
            if !(beta > 0. && beta < 1.) {
                return Err(ConfigError::BetaOutOfRange { name, value: beta });
            }
        }
        if !(self.power.is_finite() && self.power > 0.) {
            return Err(ConfigError::InvalidPower(self.power));
        }
        Ok(())
    }
}

impl Default for DdimConfig {
    fn default() -> Self {
        Self {
            trained_steps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            power: 2.,
            precision: Precision::Fp32,
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("trained schedule must have at least one step")]
    NoTrainedSteps,
    #[error("{name} must lie in (0, 1), got {value}")]
    BetaOutOfRange { name: &'static str, value: f64 },
    #[error("schedule power must be positive and finite, got {0}")]
    InvalidPower(f64),
}
