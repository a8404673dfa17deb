// src/model/schedule.rs
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::hparams::{DecayScheme, HParams, SamplingSchedule, WarmupScheme};

/// Training progress carried into and out of every training step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub global_step: i64,
    pub learning_rate: f64,
}

/// Warmup followed by staged halving.
#[derive(Debug, Clone)]
pub struct LearningRateSchedule {
    base: f64,
    warmup: WarmupScheme,
    warmup_steps: u64,
    start_decay_step: u64,
    decay_steps: u64,
    decay_factor: f64,
}

impl LearningRateSchedule {
    pub fn from_hparams(hparams: &HParams) -> Result<Self, ModelError> {
        let total = hparams.num_train_steps;
        let (start_decay_step, decay_times) = match hparams.decay()? {
            DecayScheme::None => (total, 0),
            DecayScheme::Luong5 => (total / 2, 5),
            DecayScheme::Luong10 => (total / 2, 10),
            DecayScheme::Luong234 => (total * 2 / 3, 4),
        };
        let decay_steps = if decay_times > 0 { ((total - start_decay_step) / decay_times).max(1) } else { 0 };

        tracing::info!(
            "  learning_rate={} warmup_steps={} start_decay_step={} decay_steps={} decay_factor=0.5",
            hparams.learning_rate,
            hparams.warmup_steps,
            start_decay_step,
            decay_steps
        );

        Ok(Self {
            base: hparams.learning_rate,
            warmup: hparams.warmup()?,
            warmup_steps: hparams.warmup_steps,
            start_decay_step,
            decay_steps,
            decay_factor: 0.5,
        })
    }

    pub fn at(&self, global_step: i64) -> f64 {
        let step = global_step.max(0) as u64;

        let lr = if step < self.warmup_steps {
            match self.warmup {
                WarmupScheme::T2t => {
                    let warmup_factor = (0.01f64.ln() / self.warmup_steps as f64).exp();
                    self.base * warmup_factor.powf((self.warmup_steps - step) as f64)
                }
            }
        } else {
            self.base
        };

        if self.decay_steps == 0 || step < self.start_decay_step {
            lr
        } else {
            let stages = (step - self.start_decay_step) / self.decay_steps;
            lr * self.decay_factor.powf(stages as f64)
        }
    }
}

/// Probability of feeding the decoder its own sample during training.
#[derive(Debug, Clone)]
pub struct SamplingProbability {
    max_prob: f64,
    schedule: SamplingSchedule,
    decay_steps: f64,
}

impl SamplingProbability {
    pub fn from_hparams(hparams: &HParams) -> Result<Self, ModelError> {
        Ok(Self {
            max_prob: hparams.scheduled_sampling_prob,
            schedule: hparams.sampling()?,
            decay_steps: hparams.sampling_decay_steps.max(1) as f64,
        })
    }

    pub fn enabled(&self) -> bool {
        self.max_prob > 0.0
    }

    /// Non-decreasing in `global_step` and never above the configured maximum.
    pub fn at(&self, global_step: i64) -> f64 {
        let step = global_step.max(0) as f64;
        let k = self.decay_steps;
        let p = match self.schedule {
            SamplingSchedule::Constant => self.max_prob,
            SamplingSchedule::Linear => self.max_prob * (step / k).min(1.0),
            SamplingSchedule::InverseSigmoid => {
                let teacher_forcing = k / (k + (step / k).exp());
                self.max_prob * (1.0 - teacher_forcing)
            }
        };
        p.clamp(0.0, self.max_prob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hparams() -> HParams {
        HParams { vocab_size: 10, learning_rate: 1.0, num_train_steps: 1000, ..HParams::default() }
    }

    #[test]
    fn test_constant_without_warmup_or_decay() {
        let s = LearningRateSchedule::from_hparams(&hparams()).unwrap();
        assert_eq!(s.at(0), 1.0);
        assert_eq!(s.at(999), 1.0);
    }

    #[test]
    fn test_t2t_warmup_starts_at_one_percent() {
        let hp = HParams { warmup_steps: 100, ..hparams() };
        let s = LearningRateSchedule::from_hparams(&hp).unwrap();
        assert!((s.at(0) - 0.01).abs() < 1e-9);
        assert!(s.at(50) > s.at(0));
        assert_eq!(s.at(100), 1.0);
    }

    #[test]
    fn test_luong10_halves_in_stages() {
        let hp = HParams { decay_scheme: "luong10".into(), ..hparams() };
        let s = LearningRateSchedule::from_hparams(&hp).unwrap();
        // starts at 500, stage every 50 steps
        assert_eq!(s.at(499), 1.0);
        assert_eq!(s.at(500), 1.0);
        assert_eq!(s.at(550), 0.5);
        assert_eq!(s.at(649), 0.25);
    }

    #[test]
    fn test_unknown_decay_scheme_fails() {
        let hp = HParams { decay_scheme: "cosine".into(), ..hparams() };
        assert!(LearningRateSchedule::from_hparams(&hp).is_err());
    }

    #[test]
    fn test_sampling_probability_is_monotone_and_capped() {
        for schedule in ["constant", "linear", "inverse_sigmoid"] {
            let hp = HParams {
                scheduled_sampling_prob: 0.25,
                sampling_schedule: schedule.into(),
                sampling_decay_steps: 100,
                ..hparams()
            };
            let p = SamplingProbability::from_hparams(&hp).unwrap();
            let mut last = 0.0;
            for step in (0..5000).step_by(97) {
                let now = p.at(step);
                assert!(now >= last - 1e-12, "{} decreased at step {}", schedule, step);
                assert!(now <= 0.25);
                last = now;
            }
        }
    }

    #[test]
    fn test_sampling_disabled_at_zero() {
        let p = SamplingProbability::from_hparams(&hparams()).unwrap();
        assert!(!p.enabled());
        assert_eq!(p.at(10_000), 0.0);
    }
}
