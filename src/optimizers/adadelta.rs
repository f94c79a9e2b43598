//! AdaDelta.
//!
//! ```text
//! accum        = rho * accum + (1 - rho) * g^2
//! update       = sqrt(accum_update + eps) / sqrt(accum + eps) * g
//! accum_update = rho * accum_update + (1 - rho) * update^2
//! var         -= lr * update
//! ```

use super::clip::{ClipGradientAction, NoClipGradient};
use super::slots::{apply_name, SlotStore};
use super::{named_pairs, require_non_negative, Optimizer, OptimizerResult};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub const ACCUM_SLOT: &str = "accum";
pub const ACCUM_UPDATE_SLOT: &str = "accum_update";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaDeltaConfig {
    pub learning_rate: f32,
    pub rho: f32,
    pub epsilon: f32,
}

impl Default for AdaDeltaConfig {
    fn default() -> Self {
        Self { learning_rate: 0.1, rho: 0.95, epsilon: 1e-8 }
    }
}

#[derive(Debug)]
pub struct AdaDelta {
    config: AdaDeltaConfig,
    clip: Box<dyn ClipGradientAction>,
}

impl AdaDelta {
    pub fn new(config: AdaDeltaConfig) -> OptimizerResult<Self> {
        require_non_negative("learning rate", config.learning_rate)?;
        require_non_negative("rho", config.rho)?;
        require_non_negative("epsilon", config.epsilon)?;
        Ok(Self { config, clip: Box::new(NoClipGradient) })
    }

    pub fn with_clip_gradient(mut self, clip: impl ClipGradientAction + 'static) -> Self {
        self.clip = Box::new(clip);
        self
    }

    pub fn config(&self) -> &AdaDeltaConfig {
        &self.config
    }
}

impl Optimizer for AdaDelta {
    fn name(&self) -> &'static str {
        "Adadelta"
    }

    fn is_running_on_gpu(&self) -> bool {
        true
    }

    fn clip_gradient(&self) -> &dyn ClipGradientAction {
        self.clip.as_ref()
    }

    fn create_slots(&self, slots: &mut SlotStore, variables: &[Tensor]) -> OptimizerResult<()> {
        for variable in variables {
            slots.create_filled_slot(variable, ACCUM_SLOT, 0.0)?;
            slots.create_filled_slot(variable, ACCUM_UPDATE_SLOT, 0.0)?;
        }
        Ok(())
    }

    fn apply_gradients(
        &self,
        slots: &SlotStore,
        variables: &[Tensor],
        gradients: &[Tensor],
    ) -> OptimizerResult<Vec<Tensor>> {
        let AdaDeltaConfig { learning_rate: lr, rho, epsilon } = self.config;
        named_pairs(variables, gradients)?
            .into_iter()
            .map(|(name, variable, g)| {
                let accum = slots.get_slot(&name, ACCUM_SLOT)?;
                let accum_update = slots.get_slot(&name, ACCUM_UPDATE_SLOT)?;

                let accum_new = &accum * rho + g.square() * (1.0 - rho);
                let update = (&accum_update + epsilon).sqrt() / (&accum_new + epsilon).sqrt() * g;
                let accum_update_new = &accum_update * rho + update.square() * (1.0 - rho);
                let var_new = variable - &update * lr;

                Ok(Tensor::update(
                    slots.context(),
                    &apply_name(self.name(), &name),
                    &[(variable, var_new), (&accum, accum_new), (&accum_update, accum_update_new)],
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
    fn first_step_matches_closed_form() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![1.0].into_dyn());
        let loss = (&w * 2.0).sum();
        let config = AdaDeltaConfig { learning_rate: 1.0, rho: 0.5, epsilon: 1e-2 };
        let targets = AdaDelta::new(config).unwrap().prepare_targets(&ctx, &[w], &loss).unwrap();

        let mut session = Session::new();
        session.initialize_graph_variables(&ctx).unwrap();
        session.initialize_optimizer_variables(&ctx).unwrap();
        session.run_training_step(&ctx, &targets, &HashMap::new()).unwrap();

        // accum = 0.5 * 4 = 2, update = sqrt(0.01) / sqrt(2.01) * 2
        let update = 0.1f32 / 2.01f32.sqrt() * 2.0;
        let read = |name: &str| session.variable(name).unwrap().iter().copied().next().unwrap();
        assert!((read("optimizer_w-accum") - 2.0).abs() < 1e-6);
        assert!((read("optimizer_w-accum_update") - 0.5 * update * update).abs() < 1e-6);
        assert!((read("w") - (1.0 - update)).abs() < 1e-6);
    }

    #[test]
    fn zero_epsilon_is_allowed_negative_rho_is_not() {
        assert!(AdaDelta::new(AdaDeltaConfig { epsilon: 0.0, ..Default::default() }).is_ok());
        assert!(AdaDelta::new(AdaDeltaConfig { rho: -0.5, ..Default::default() }).is_err());
    }
}
