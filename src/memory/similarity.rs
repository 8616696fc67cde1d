//! Vector similarity and recency decay
//!
//! Both are selectable in configuration. Scores handed to the retrieval
//! engine are always clamped into `[0, 1]` so that relevance and recency can
//! be blended linearly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Similarity measure between two embeddings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// Cosine of the angle between the vectors
    #[default]
    Cosine,
    /// Raw dot product; meaningful for pre-normalized embeddings
    Dot,
}

impl SimilarityMetric {
    /// Raw similarity. Cosine of a zero vector is 0.
    pub fn raw(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => cosine(a, b),
            Self::Dot => dot(a, b),
        }
    }

    /// Similarity clamped into `[0, 1]`; NaN maps to 0.
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        let s = self.raw(a, b);
        if s.is_nan() {
            0.0
        } else {
            s.clamp(0.0, 1.0)
        }
    }
}

/// Dot product over the shared prefix of two slices
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity in `[-1, 1]`
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let na = dot(a, a).sqrt();
    let nb = dot(b, b).sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot(a, b) / (na * nb)
}

/// Recency decay over entry age
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecencyDecay {
    /// Score halves every `half_life_secs`
    Exponential { half_life_secs: u64 },
    /// Score falls linearly to zero at `horizon_secs`
    Linear { horizon_secs: u64 },
}

impl Default for RecencyDecay {
    fn default() -> Self {
        Self::Exponential {
            half_life_secs: 24 * 60 * 60,
        }
    }
}

impl RecencyDecay {
    /// Recency score in `[0, 1]` for an entry of the given age.
    ///
    /// Negative ages (clock skew) are treated as brand new.
    pub fn score(&self, age_secs: f64) -> f32 {
        let age = age_secs.max(0.0);
        let s = match *self {
            Self::Exponential { half_life_secs } => {
                (-(std::f64::consts::LN_2) * age / half_life_secs as f64).exp()
            }
            Self::Linear { horizon_secs } => 1.0 - age / horizon_secs as f64,
        };
        s.clamp(0.0, 1.0) as f32
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Exponential { half_life_secs: 0 } => Err(Error::Config(
                "memory.recency_decay.half_life_secs must be > 0".into(),
            )),
            Self::Linear { horizon_secs: 0 } => Err(Error::Config(
                "memory.recency_decay.horizon_secs must be > 0".into(),
            )),
            _ => Ok(()),
        }
    }
}
