// src/model/optimizer.rs
use anyhow::Result;
use tch::{nn, nn::OptimizerConfig, Kind, Tensor};

use crate::device::ParamStores;
use crate::hparams::OptimizerKind;

/// Norms observed during one update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientStats {
    /// Global norm before clipping.
    pub grad_norm: f64,
    /// Global norm after clipping.
    pub clipped_norm: f64,
}

/// Optimizer over every per-device parameter store, with global-norm clipping.
pub struct StepOptimizer {
    optimizers: Vec<nn::Optimizer>,
    variables: Vec<Tensor>,
    max_gradient_norm: f64,
}

impl StepOptimizer {
    pub fn new(kind: OptimizerKind, stores: &ParamStores, learning_rate: f64, max_gradient_norm: f64) -> Result<Self> {
        let optimizers = stores
            .stores()
            .iter()
            .map(|vs| match kind {
                OptimizerKind::Sgd => nn::Sgd::default().build(vs, learning_rate),
                OptimizerKind::Adam => nn::Adam::default().build(vs, learning_rate),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { optimizers, variables: stores.trainable_variables(), max_gradient_norm })
    }

    pub fn set_lr(&mut self, learning_rate: f64) {
        for opt in &mut self.optimizers {
            opt.set_lr(learning_rate);
        }
    }

    pub fn zero_grad(&mut self) {
        for opt in &mut self.optimizers {
            opt.zero_grad();
        }
    }

    /// √Σ‖g‖² over all defined gradients.
    pub fn global_norm(&self) -> f64 {
        self.variables
            .iter()
            .map(|v| v.grad())
            .filter(|g| g.defined())
            .map(|g| g.to_kind(Kind::Double).square().sum(Kind::Double).double_value(&[]))
            .sum::<f64>()
            .sqrt()
    }

    /// Scales every gradient by `max / max(norm, max)`.
    pub fn clip_by_global_norm(&self) -> GradientStats {
        let grad_norm = self.global_norm();
        let scale = self.max_gradient_norm / grad_norm.max(self.max_gradient_norm);
        if scale < 1.0 {
            tch::no_grad(|| {
                for v in &self.variables {
                    let mut g = v.grad();
                    if g.defined() {
                        let scaled = &g * scale;
                        g.copy_(&scaled);
                    }
                }
            });
        }
        GradientStats { grad_norm, clipped_norm: grad_norm * scale }
    }

    /// zero-grad, backward, clip, update.
    pub fn minimize(&mut self, loss: &Tensor) -> GradientStats {
        self.zero_grad();
        loss.backward();
        let stats = self.clip_by_global_norm();
        for opt in &mut self.optimizers {
            opt.step();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn quadratic(stores: &ParamStores) -> Tensor {
        let w = stores.scoped(Device::Cpu, "w").ones("x", &[3]);
        // d/dw of 10 * Σ w² at w = 1 is 20 per entry
        (&w * &w).sum(Kind::Float) * 10.0
    }

    #[test]
    fn test_clipping_caps_global_norm() {
        let stores = ParamStores::cpu();
        let loss = quadratic(&stores);
        let mut opt = StepOptimizer::new(OptimizerKind::Sgd, &stores, 0.1, 1.0).unwrap();
        opt.zero_grad();
        loss.backward();
        let stats = opt.clip_by_global_norm();
        assert!((stats.grad_norm - (3.0f64 * 400.0).sqrt()).abs() < 1e-3);
        assert!((stats.clipped_norm - 1.0).abs() < 1e-6);
        assert!((opt.global_norm() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_small_gradients_are_untouched() {
        let stores = ParamStores::cpu();
        let loss = quadratic(&stores);
        let mut opt = StepOptimizer::new(OptimizerKind::Adam, &stores, 0.1, 1e6).unwrap();
        let stats = opt.minimize(&loss);
        assert_eq!(stats.grad_norm, stats.clipped_norm);
    }

    #[test]
    fn test_sgd_step_moves_parameters() {
        let stores = ParamStores::cpu();
        let loss = quadratic(&stores);
        let mut opt = StepOptimizer::new(OptimizerKind::Sgd, &stores, 0.01, 1e6).unwrap();
        opt.minimize(&loss);
        let w = &stores.trainable_variables()[0];
        // 1 - 0.01 * 20
        assert!((w.double_value(&[0]) - 0.8).abs() < 1e-5);
    }
}
