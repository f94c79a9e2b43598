//! AdaGrad: `acc += g^2; var -= lr * g / sqrt(acc)`.

use super::clip::{ClipGradientAction, NoClipGradient};
use super::slots::{apply_name, SlotStore};
use super::{named_pairs, require_non_negative, Optimizer, OptimizerResult};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub const ACCUMULATOR_SLOT: &str = "accumulator";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaGradConfig {
    pub learning_rate: f32,
    pub initial_accumulator_value: f32,
}

impl Default for AdaGradConfig {
    fn default() -> Self {
        Self { learning_rate: 0.1, initial_accumulator_value: 0.01 }
    }
}

#[derive(Debug)]
pub struct AdaGrad {
    config: AdaGradConfig,
    clip: Box<dyn ClipGradientAction>,
}

impl AdaGrad {
    pub fn new(config: AdaGradConfig) -> OptimizerResult<Self> {
        require_non_negative("learning rate", config.learning_rate)?;
        require_non_negative("initial accumulator value", config.initial_accumulator_value)?;
        Ok(Self { config, clip: Box::new(NoClipGradient) })
    }

    pub fn with_clip_gradient(mut self, clip: impl ClipGradientAction + 'static) -> Self {
        self.clip = Box::new(clip);
        self
    }

    pub fn config(&self) -> &AdaGradConfig {
        &self.config
    }
}

impl Optimizer for AdaGrad {
    fn name(&self) -> &'static str {
        "Adagrad"
    }

    fn is_running_on_gpu(&self) -> bool {
        true
    }

    fn clip_gradient(&self) -> &dyn ClipGradientAction {
        self.clip.as_ref()
    }

    fn create_slots(&self, slots: &mut SlotStore, variables: &[Tensor]) -> OptimizerResult<()> {
        for variable in variables {
            slots.create_filled_slot(variable, ACCUMULATOR_SLOT, self.config.initial_accumulator_value)?;
        }
        Ok(())
    }

    fn apply_gradients(
        &self,
        slots: &SlotStore,
        variables: &[Tensor],
        gradients: &[Tensor],
    ) -> OptimizerResult<Vec<Tensor>> {
        let lr = self.config.learning_rate;
        named_pairs(variables, gradients)?
            .into_iter()
            .map(|(name, variable, g)| {
                let acc = slots.get_slot(&name, ACCUMULATOR_SLOT)?;
                let acc_new = &acc + g.square();
                let var_new = variable - g * lr / acc_new.sqrt();
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
    use crate::tensor::GraphContext;
    use ndarray::{array, ArrayD, IxDyn};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn accumulator_slot_has_parameter_shape() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "kernel", ArrayD::zeros(IxDyn(&[4, 2])));
        let b = Tensor::new_parameter(&ctx, "bias", array![0.0, 0.0].into_dyn());
        let mut slots = SlotStore::new(&ctx);
        AdaGrad::new(AdaGradConfig::default())
            .unwrap()
            .create_slots(&mut slots, &[w, b])
            .unwrap();

        assert_eq!(slots.slot_names(), vec!["optimizer_bias-accumulator", "optimizer_kernel-accumulator"]);
        assert_eq!(slots.get_slot("kernel", ACCUMULATOR_SLOT).unwrap().shape(), Some(vec![4, 2]));
    }

    #[test]
    fn apply_without_slots_reports_missing_slot() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![1.0].into_dyn());
        let g = Tensor::scalar(&ctx, 1.0);
        let slots = SlotStore::new(&ctx);
        let err = AdaGrad::new(AdaGradConfig::default())
            .unwrap()
            .apply_gradients(&slots, &[w], &[g])
            .unwrap_err();
        assert!(err.to_string().contains("accumulator"));
    }
}
