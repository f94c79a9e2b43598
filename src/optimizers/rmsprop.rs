//! RMSProp, с необязательным центрированием.
//!
//! ```text
//! rms  = rms + (g^2 - rms) * (1 - decay)
//! mg   = mg + (g - mg) * (1 - decay)                    (centered)
//! den  = rms - mg^2 + eps   (centered) | rms + eps
//! mom  = momentum * mom + lr * g / sqrt(den)
//! var -= mom
//! ```

use super::clip::{ClipGradientAction, NoClipGradient};
use super::slots::{apply_name, SlotStore};
use super::{named_pairs, require_non_negative, Optimizer, OptimizerResult};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub const RMS_SLOT: &str = "rms";
pub const MOMENTUM_SLOT: &str = "momentum";
pub const MG_SLOT: &str = "mg";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RmsPropConfig {
    pub learning_rate: f32,
    pub decay: f32,
    pub momentum: f32,
    pub epsilon: f32,
    pub centered: bool,
}

impl Default for RmsPropConfig {
    fn default() -> Self {
        Self { learning_rate: 0.001, decay: 0.9, momentum: 0.0, epsilon: 1e-10, centered: false }
    }
}

#[derive(Debug)]
pub struct RmsProp {
    config: RmsPropConfig,
    clip: Box<dyn ClipGradientAction>,
}

impl RmsProp {
    pub fn new(config: RmsPropConfig) -> OptimizerResult<Self> {
        require_non_negative("learning rate", config.learning_rate)?;
        require_non_negative("decay", config.decay)?;
        require_non_negative("momentum", config.momentum)?;
        require_non_negative("epsilon", config.epsilon)?;
        Ok(Self { config, clip: Box::new(NoClipGradient) })
    }

    pub fn with_clip_gradient(mut self, clip: impl ClipGradientAction + 'static) -> Self {
        self.clip = Box::new(clip);
        self
    }

    pub fn config(&self) -> &RmsPropConfig {
        &self.config
    }
}

impl Optimizer for RmsProp {
    fn name(&self) -> &'static str {
        "RMSProp"
    }

    fn is_running_on_gpu(&self) -> bool {
        true
    }

    fn clip_gradient(&self) -> &dyn ClipGradientAction {
        self.clip.as_ref()
    }

    fn create_slots(&self, slots: &mut SlotStore, variables: &[Tensor]) -> OptimizerResult<()> {
        for variable in variables {
            slots.create_filled_slot(variable, RMS_SLOT, 1.0)?;
            slots.create_filled_slot(variable, MOMENTUM_SLOT, 0.0)?;
            if self.config.centered {
                slots.create_filled_slot(variable, MG_SLOT, 0.0)?;
            }
        }
        Ok(())
    }

    fn apply_gradients(
        &self,
        slots: &SlotStore,
        variables: &[Tensor],
        gradients: &[Tensor],
    ) -> OptimizerResult<Vec<Tensor>> {
        let RmsPropConfig { learning_rate: lr, decay, momentum, epsilon, centered } = self.config;
        named_pairs(variables, gradients)?
            .into_iter()
            .map(|(name, variable, g)| {
                let rms = slots.get_slot(&name, RMS_SLOT)?;
                let mom = slots.get_slot(&name, MOMENTUM_SLOT)?;

                let rms_new = &rms + (g.square() - &rms) * (1.0 - decay);
                let (denom, centered_mg) = if centered {
                    let mg = slots.get_slot(&name, MG_SLOT)?;
                    let mg_new = &mg + (g - &mg) * (1.0 - decay);
                    (&rms_new - mg_new.square() + epsilon, Some((mg, mg_new)))
                } else {
                    (&rms_new + epsilon, None)
                };
                let mom_new = &mom * momentum + g * lr / denom.sqrt();
                let var_new = variable - &mom_new;

                let mut pairs = vec![(variable, var_new), (&rms, rms_new), (&mom, mom_new)];
                if let Some((mg, mg_new)) = &centered_mg {
                    pairs.push((mg, mg_new.clone()));
                }
                Ok(Tensor::update(slots.context(), &apply_name(self.name(), &name), &pairs))
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

    fn one_step(config: RmsPropConfig) -> Session {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![1.0].into_dyn());
        let loss = (&w * 2.0).sum();
        let targets = RmsProp::new(config).unwrap().prepare_targets(&ctx, &[w], &loss).unwrap();

        let mut session = Session::new();
        session.initialize_graph_variables(&ctx).unwrap();
        session.initialize_optimizer_variables(&ctx).unwrap();
        session.run_training_step(&ctx, &targets, &HashMap::new()).unwrap();
        session
    }

    fn read(session: &Session, name: &str) -> f32 {
        session.variable(name).unwrap().iter().copied().next().unwrap()
    }

    #[test]
    fn plain_rmsprop_scales_by_running_square() {
        let config = RmsPropConfig { learning_rate: 0.1, decay: 0.5, momentum: 0.0, epsilon: 0.0, centered: false };
        let session = one_step(config);
        // rms = 1 + (4 - 1) * 0.5 = 2.5
        let rms = 2.5f32;
        let step = 0.1 * 2.0 / rms.sqrt();
        assert!((read(&session, "optimizer_w-rms") - rms).abs() < 1e-6);
        assert!((read(&session, "optimizer_w-momentum") - step).abs() < 1e-6);
        assert!((read(&session, "w") - (1.0 - step)).abs() < 1e-6);
        assert!(session.variable("optimizer_w-mg").is_none());
    }

    #[test]
    fn centered_rmsprop_subtracts_mean_gradient() {
        let config = RmsPropConfig { learning_rate: 0.1, decay: 0.5, momentum: 0.9, epsilon: 0.0, centered: true };
        let session = one_step(config);
        // mg = 0 + 2 * 0.5 = 1, den = 2.5 - 1 = 1.5
        let step = 0.1 * 2.0 / 1.5f32.sqrt();
        assert!((read(&session, "optimizer_w-mg") - 1.0).abs() < 1e-6);
        assert!((read(&session, "w") - (1.0 - step)).abs() < 1e-6);
    }
}
