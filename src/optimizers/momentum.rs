//! Momentum: `acc = momentum * acc + g`.
//!
//! Обычный вариант: `var -= lr * acc`.
//! Вариант Нестерова: `var -= lr * g + lr * momentum * acc`.

use super::clip::{ClipGradientAction, NoClipGradient};
use super::slots::{apply_name, SlotStore};
use super::{named_pairs, require_non_negative, Optimizer, OptimizerResult};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub const MOMENTUM_SLOT: &str = "momentum";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumConfig {
    pub learning_rate: f32,
    pub momentum: f32,
    pub use_nesterov: bool,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self { learning_rate: 0.001, momentum: 0.99, use_nesterov: true }
    }
}

#[derive(Debug)]
pub struct Momentum {
    config: MomentumConfig,
    clip: Box<dyn ClipGradientAction>,
}

impl Momentum {
    pub fn new(config: MomentumConfig) -> OptimizerResult<Self> {
        require_non_negative("learning rate", config.learning_rate)?;
        require_non_negative("momentum", config.momentum)?;
        Ok(Self { config, clip: Box::new(NoClipGradient) })
    }

    pub fn with_clip_gradient(mut self, clip: impl ClipGradientAction + 'static) -> Self {
        self.clip = Box::new(clip);
        self
    }

    pub fn config(&self) -> &MomentumConfig {
        &self.config
    }
}

impl Optimizer for Momentum {
    fn name(&self) -> &'static str {
        "Momentum"
    }

    fn is_running_on_gpu(&self) -> bool {
        true
    }

    fn clip_gradient(&self) -> &dyn ClipGradientAction {
        self.clip.as_ref()
    }

    fn create_slots(&self, slots: &mut SlotStore, variables: &[Tensor]) -> OptimizerResult<()> {
        for variable in variables {
            slots.create_filled_slot(variable, MOMENTUM_SLOT, 0.0)?;
        }
        Ok(())
    }

    fn apply_gradients(
        &self,
        slots: &SlotStore,
        variables: &[Tensor],
        gradients: &[Tensor],
    ) -> OptimizerResult<Vec<Tensor>> {
        let MomentumConfig { learning_rate: lr, momentum, use_nesterov } = self.config;
        named_pairs(variables, gradients)?
            .into_iter()
            .map(|(name, variable, g)| {
                let acc = slots.get_slot(&name, MOMENTUM_SLOT)?;
                let acc_new = &acc * momentum + g;
                let step = if use_nesterov {
                    g * lr + &acc_new * (momentum * lr)
                } else {
                    &acc_new * lr
                };
                let var_new = variable - step;
                Ok(Tensor::update(
                    slots.context(),
                    &apply_name(self.name(), &name),
                    &[(variable, var_new), (&acc, acc_new)],
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Session;
    use crate::tensor::GraphContext;
    use ndarray::{array, ArrayD};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn assert_close(actual: &ArrayD<f32>, expected: &[f32]) {
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6, "{} != {}", a, e);
        }
    }

    /// Два шага с постоянным градиентом 1 (loss = sum(w)).
    fn two_steps(config: MomentumConfig) -> (ArrayD<f32>, ArrayD<f32>) {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![0.0].into_dyn());
        let loss = w.sum();
        let targets = Momentum::new(config).unwrap().prepare_targets(&ctx, &[w], &loss).unwrap();

        let mut session = Session::new();
        session.initialize_graph_variables(&ctx).unwrap();
        session.initialize_optimizer_variables(&ctx).unwrap();
        for _ in 0..2 {
            session.run_training_step(&ctx, &targets, &HashMap::new()).unwrap();
        }
        (
            session.variable("w").cloned().unwrap(),
            session.variable("optimizer_w-momentum").cloned().unwrap(),
        )
    }

    #[test]
    fn plain_momentum_accumulates_velocity() {
        let (w, acc) = two_steps(MomentumConfig { learning_rate: 0.1, momentum: 0.5, use_nesterov: false });
        // acc: 1, 1.5; w: -0.1, -0.25
        assert_close(&acc, &[1.5]);
        assert_close(&w, &[-0.25]);
    }

    #[test]
    fn nesterov_looks_ahead() {
        let (w, acc) = two_steps(MomentumConfig { learning_rate: 0.1, momentum: 0.5, use_nesterov: true });
        // step 1: acc 1, w -= 0.1 + 0.05; step 2: acc 1.5, w -= 0.1 + 0.075
        assert_close(&acc, &[1.5]);
        assert_close(&w, &[-0.325]);
    }

    #[test]
    fn negative_momentum_is_rejected() {
        let config = MomentumConfig { momentum: -0.1, ..Default::default() };
        assert_eq!(
            Momentum::new(config).unwrap_err().to_string(),
            "momentum -0.1 should be >= 0."
        );
    }
}
