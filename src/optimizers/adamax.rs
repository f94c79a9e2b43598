//! Adamax: вариант Adam с нормой бесконечности вместо второго момента.
//!
//! ```text
//! m    = m + (g - m) * (1 - beta1)
//! v    = max(beta2 * v, |g|)
//! var -= lr / (1 - beta1_power) * m / (v + eps)
//! ```

use super::adam::{create_beta_power, BETA1_POWER, M_SLOT, V_SLOT};
use super::clip::{ClipGradientAction, NoClipGradient};
use super::slots::{apply_name, SlotStore};
use super::{named_pairs, require_non_negative, require_open_unit, Optimizer, OptimizerResult};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamaxConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamaxConfig {
    fn default() -> Self {
        Self { learning_rate: 0.001, beta1: 0.9, beta2: 0.999, epsilon: 1e-7 }
    }
}

#[derive(Debug)]
pub struct Adamax {
    config: AdamaxConfig,
    clip: Box<dyn ClipGradientAction>,
}

impl Adamax {
    pub fn new(config: AdamaxConfig) -> OptimizerResult<Self> {
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

    pub fn config(&self) -> &AdamaxConfig {
        &self.config
    }
}

impl Optimizer for Adamax {
    fn name(&self) -> &'static str {
        "Adamax"
    }

    fn is_running_on_gpu(&self) -> bool {
        false
    }

    fn clip_gradient(&self) -> &dyn ClipGradientAction {
        self.clip.as_ref()
    }

    fn create_slots(&self, slots: &mut SlotStore, variables: &[Tensor]) -> OptimizerResult<()> {
        for variable in variables {
            slots.create_filled_slot(variable, M_SLOT, 0.0)?;
            slots.create_filled_slot(variable, V_SLOT, 0.0)?;
        }
        create_beta_power(slots, BETA1_POWER, self.config.beta1)
    }

    fn apply_gradients(
        &self,
        slots: &SlotStore,
        variables: &[Tensor],
        gradients: &[Tensor],
    ) -> OptimizerResult<Vec<Tensor>> {
        let AdamaxConfig { learning_rate: lr, beta1, beta2, epsilon } = self.config;
        let beta1_power = slots.get_global(BETA1_POWER)?;
        let lr_t = lr / (1.0 - &beta1_power);

        named_pairs(variables, gradients)?
            .into_iter()
            .map(|(name, variable, g)| {
                let m = slots.get_slot(&name, M_SLOT)?;
                let v = slots.get_slot(&name, V_SLOT)?;

                let m_new = &m + (g - &m) * (1.0 - beta1);
                let v_new = (&v * beta2).maximum(&g.abs());
                let var_new = variable - &lr_t * &m_new / (&v_new + epsilon);

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
    use ndarray::{arr0, array};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[test]
    fn infinity_norm_tracks_largest_gradient() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![1.0, 1.0].into_dyn());
        let scale = Tensor::new_literal(&ctx, array![-4.0, 0.5].into_dyn(), "scale");
        let loss = (&w * &scale).sum();
        let config = AdamaxConfig { learning_rate: 0.1, beta1: 0.5, beta2: 0.5, epsilon: 0.0 };
        let targets = Adamax::new(config).unwrap().prepare_targets(&ctx, &[w], &loss).unwrap();

        let mut session = Session::new();
        session.initialize_graph_variables(&ctx).unwrap();
        session.initialize_optimizer_variables(&ctx).unwrap();
        session.run_training_step(&ctx, &targets, &HashMap::new()).unwrap();

        assert_eq!(session.variable("optimizer_w-v"), Some(&array![4.0, 0.5].into_dyn()));
        assert_eq!(session.variable("optimizer_beta1_power"), Some(&arr0(0.25).into_dyn()));
        assert!(session.variable("optimizer_beta2_power").is_none());
        // lr_t = 0.1 / 0.5, m = g / 2, m / v = sign(g) / 2
        let w = session.variable("w").unwrap();
        let expected = [1.0 + 0.1, 1.0 - 0.1];
        for (a, e) in w.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6, "{} != {}", a, e);
        }
    }

    #[test]
    fn adamax_is_not_gpu_capable() {
        assert!(!Adamax::new(AdamaxConfig::default()).unwrap().is_running_on_gpu());
    }
}
