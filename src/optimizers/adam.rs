//! Adam с коррекцией смещения через переменные `beta1_power` / `beta2_power`.
//!
//! ```text
//! lr_t = lr * sqrt(1 - beta2_power) / (1 - beta1_power)
//! m    = m + (g - m) * (1 - beta1)
//! v    = v + (g^2 - v) * (1 - beta2)
//! var -= lr_t * m / (sqrt(v) + eps)
//! var -= lr_t * (g * (1 - beta1) + beta1 * m) / (sqrt(v) + eps)   (nesterov)
//! ```
//!
//! После узлов обновления степени бет домножаются на `beta1` и `beta2`.

use super::clip::{ClipGradientAction, NoClipGradient};
use super::slots::{apply_name, SlotStore};
use super::{named_pairs, require_non_negative, require_open_unit, Optimizer, OptimizerResult};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub const M_SLOT: &str = "m";
pub const V_SLOT: &str = "v";
pub const BETA1_POWER: &str = "beta1_power";
pub const BETA2_POWER: &str = "beta2_power";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub use_nesterov: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self { learning_rate: 0.001, beta1: 0.9, beta2: 0.999, epsilon: 1e-7, use_nesterov: false }
    }
}

#[derive(Debug)]
pub struct Adam {
    config: AdamConfig,
    clip: Box<dyn ClipGradientAction>,
}

impl Adam {
    pub fn new(config: AdamConfig) -> OptimizerResult<Self> {
        require_non_negative("learning rate", config.learning_rate)?;
        require_open_unit("beta1", config.beta1)?;
        require_open_unit("beta2", config.beta2)?;
        require_non_negative("epsilon", config.epsilon)?;
        Ok(Self { config, clip: Box::new(NoClipGradient) })
    }

    pub fn with_clip_gradient(mut self, clip: impl ClipGradientAction + 'static) -> Self {
        self.clip = Box::new(clip);
        self
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }
}

/// Глобальная степень беты, домножаемая на `beta` раз за шаг.
pub(crate) fn create_beta_power(slots: &mut SlotStore, name: &str, beta: f32) -> OptimizerResult<()> {
    let power = slots.create_global(name, beta);
    let advance = power.assign(&(&power * beta));
    slots.register_step_update(&power, &advance)
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "Adam"
    }

    fn is_running_on_gpu(&self) -> bool {
        true
    }

    fn clip_gradient(&self) -> &dyn ClipGradientAction {
        self.clip.as_ref()
    }

    fn create_slots(&self, slots: &mut SlotStore, variables: &[Tensor]) -> OptimizerResult<()> {
        for variable in variables {
            slots.create_filled_slot(variable, M_SLOT, 0.0)?;
            slots.create_filled_slot(variable, V_SLOT, 0.0)?;
        }
        create_beta_power(slots, BETA1_POWER, self.config.beta1)?;
        create_beta_power(slots, BETA2_POWER, self.config.beta2)
    }

    fn apply_gradients(
        &self,
        slots: &SlotStore,
        variables: &[Tensor],
        gradients: &[Tensor],
    ) -> OptimizerResult<Vec<Tensor>> {
        let AdamConfig { learning_rate: lr, beta1, beta2, epsilon, use_nesterov } = self.config;
        let beta1_power = slots.get_global(BETA1_POWER)?;
        let beta2_power = slots.get_global(BETA2_POWER)?;
        let lr_t = (1.0 - &beta2_power).sqrt() * lr / (1.0 - &beta1_power);

        named_pairs(variables, gradients)?
            .into_iter()
            .map(|(name, variable, g)| {
                let m = slots.get_slot(&name, M_SLOT)?;
                let v = slots.get_slot(&name, V_SLOT)?;

                let m_new = &m + (g - &m) * (1.0 - beta1);
                let v_new = &v + (g.square() - &v) * (1.0 - beta2);
                let numerator = if use_nesterov {
                    g * (1.0 - beta1) + &m_new * beta1
                } else {
                    m_new.clone()
                };
                let var_new = variable - &lr_t * numerator / (v_new.sqrt() + epsilon);

                Ok(Tensor::update(
                    slots.context(),
                    &apply_name(self.name(), &name),
                    &[(variable, var_new), (&m, m_new), (&v, v_new)],
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
    use ndarray::array;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[test]
    fn betas_must_lie_in_open_unit_interval() {
        assert!(Adam::new(AdamConfig { beta1: 1.0, ..Default::default() }).is_err());
        assert!(Adam::new(AdamConfig { beta2: 0.0, ..Default::default() }).is_err());
        assert_eq!(
            Adam::new(AdamConfig { beta1: 1.5, ..Default::default() }).unwrap_err().to_string(),
            "beta1 1.5 should be in (0, 1)."
        );
    }

    #[test]
    fn nesterov_first_step() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![1.0].into_dyn());
        let loss = (&w * 2.0).sum();
        let config = AdamConfig { learning_rate: 0.1, beta1: 0.5, beta2: 0.75, epsilon: 0.0, use_nesterov: true };
        let targets = Adam::new(config).unwrap().prepare_targets(&ctx, &[w], &loss).unwrap();

        let mut session = Session::new();
        session.initialize_graph_variables(&ctx).unwrap();
        session.initialize_optimizer_variables(&ctx).unwrap();
        session.run_training_step(&ctx, &targets, &HashMap::new()).unwrap();

        // m = 1, v = 1, lr_t = 0.1 * sqrt(0.25) / 0.5 = 0.1
        // nesterov numerator = 2 * 0.5 + 0.5 * 1 = 1.5
        let w = session.variable("w").unwrap().iter().copied().next().unwrap();
        assert!((w - (1.0 - 0.15)).abs() < 1e-6, "{}", w);
    }
}
