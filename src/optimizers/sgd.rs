//! Stochastic Gradient Descent: `var -= lr * g`.

use super::clip::{ClipGradientAction, NoClipGradient};
use super::slots::{apply_name, SlotStore};
use super::{named_pairs, require_non_negative, Optimizer, OptimizerResult};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub learning_rate: f32,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self { learning_rate: 0.2 }
    }
}

#[derive(Debug)]
pub struct Sgd {
    config: SgdConfig,
    clip: Box<dyn ClipGradientAction>,
}

impl Sgd {
    pub fn new(config: SgdConfig) -> OptimizerResult<Self> {
        require_non_negative("learning rate", config.learning_rate)?;
        Ok(Self { config, clip: Box::new(NoClipGradient) })
    }

    pub fn with_clip_gradient(mut self, clip: impl ClipGradientAction + 'static) -> Self {
        self.clip = Box::new(clip);
        self
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "SGD"
    }

    fn is_running_on_gpu(&self) -> bool {
        true
    }

    fn clip_gradient(&self) -> &dyn ClipGradientAction {
        self.clip.as_ref()
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
            .map(|(name, variable, gradient)| {
                let new_value = variable - gradient * lr;
                Ok(Tensor::update(slots.context(), &apply_name(self.name(), &name), &[(variable, new_value)]))
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
    fn negative_learning_rate_is_rejected() {
        assert!(Sgd::new(SgdConfig { learning_rate: -0.1 }).is_err());
        assert!(Sgd::new(SgdConfig { learning_rate: 0.0 }).is_ok());
    }

    #[test]
    fn one_step_moves_against_gradient() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![1.0, -2.0].into_dyn());
        // d(sum(3w))/dw = 3
        let loss = (&w * 3.0).sum();
        let sgd = Sgd::new(SgdConfig { learning_rate: 0.5 }).unwrap();
        let targets = sgd.prepare_targets(&ctx, &[w.clone()], &loss).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name().as_deref(), Some("ApplySGD_w"));

        let mut session = Session::new();
        session.initialize_graph_variables(&ctx).unwrap();
        session.initialize_optimizer_variables(&ctx).unwrap();
        session.run_training_step(&ctx, &targets, &HashMap::new()).unwrap();
        assert_eq!(session.variable("w"), Some(&array![-0.5, -3.5].into_dyn()));
        assert!(session.optimizer_state(&ctx).is_empty());
    }
}
