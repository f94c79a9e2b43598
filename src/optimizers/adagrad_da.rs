//! AdaGrad Dual Averaging.
//!
//! Слоты хранят сумму градиентов `ga` и сумму их квадратов `gga`. Переменная
//! не обновляется инкрементально, а вычисляется заново из аккумуляторов:
//!
//! ```text
//! ga  += g
//! gga += g^2
//! denom = l2 * T * lr + sqrt(gga)
//! var = lr * sign(-ga) * max(|ga| - l1 * T, 0) / denom   (l1 > 0)
//! var = -lr * ga / denom                                  (l1 = 0)
//! ```
//!
//! `T` - глобальный счетчик шагов до продвижения, он стартует с 0.

use super::clip::{ClipGradientAction, NoClipGradient};
use super::slots::{apply_name, SlotStore};
use super::{named_pairs, require_non_negative, Optimizer, OptimizerResult};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub const GRADIENT_ACCUMULATOR_SLOT: &str = "gradient_accumulator";
pub const GRADIENT_SQUARED_ACCUMULATOR_SLOT: &str = "gradient_squared_accumulator";
pub const GLOBAL_STEP: &str = "adagrad-da-global-step";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaGradDAConfig {
    pub learning_rate: f32,
    pub initial_accumulator_value: f32,
    pub l1_strength: f32,
    pub l2_strength: f32,
}

impl Default for AdaGradDAConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            initial_accumulator_value: 0.01,
            l1_strength: 0.01,
            l2_strength: 0.01,
        }
    }
}

#[derive(Debug)]
pub struct AdaGradDA {
    config: AdaGradDAConfig,
    clip: Box<dyn ClipGradientAction>,
}

impl AdaGradDA {
    pub fn new(config: AdaGradDAConfig) -> OptimizerResult<Self> {
        require_non_negative("learning rate", config.learning_rate)?;
        require_non_negative("initial accumulator value", config.initial_accumulator_value)?;
        require_non_negative("l1 strength", config.l1_strength)?;
        require_non_negative("l2 strength", config.l2_strength)?;
        Ok(Self { config, clip: Box::new(NoClipGradient) })
    }

    pub fn with_clip_gradient(mut self, clip: impl ClipGradientAction + 'static) -> Self {
        self.clip = Box::new(clip);
        self
    }

    pub fn config(&self) -> &AdaGradDAConfig {
        &self.config
    }
}

impl Optimizer for AdaGradDA {
    fn name(&self) -> &'static str {
        "AdaGradDA"
    }

    fn is_running_on_gpu(&self) -> bool {
        true
    }

    fn clip_gradient(&self) -> &dyn ClipGradientAction {
        self.clip.as_ref()
    }

    fn create_slots(&self, slots: &mut SlotStore, variables: &[Tensor]) -> OptimizerResult<()> {
        for variable in variables {
            slots.create_filled_slot(variable, GRADIENT_ACCUMULATOR_SLOT, 0.0)?;
            slots.create_filled_slot(
                variable,
                GRADIENT_SQUARED_ACCUMULATOR_SLOT,
                self.config.initial_accumulator_value,
            )?;
        }

        let step = slots.create_global(GLOBAL_STEP, 0.0);
        let one = Tensor::scalar(slots.context(), 1.0);
        let advance = step.assign_add(&one);
        slots.register_step_update(&step, &advance)
    }

    fn apply_gradients(
        &self,
        slots: &SlotStore,
        variables: &[Tensor],
        gradients: &[Tensor],
    ) -> OptimizerResult<Vec<Tensor>> {
        let AdaGradDAConfig { learning_rate: lr, l1_strength: l1, l2_strength: l2, .. } = self.config;
        let step = slots.get_global(GLOBAL_STEP)?;

        named_pairs(variables, gradients)?
            .into_iter()
            .map(|(name, variable, g)| {
                let ga = slots.get_slot(&name, GRADIENT_ACCUMULATOR_SLOT)?;
                let gga = slots.get_slot(&name, GRADIENT_SQUARED_ACCUMULATOR_SLOT)?;
                let ga_new = &ga + g;
                let gga_new = &gga + g.square();

                let denom = &step * (l2 * lr) + gga_new.sqrt();
                let var_new = if l1 > 0.0 {
                    let shrunk = (ga_new.abs() - &step * l1).relu();
                    (-&ga_new).sign() * lr * shrunk / denom
                } else {
                    -(&ga_new * lr) / denom
                };

                Ok(Tensor::update(
                    slots.context(),
                    &apply_name(self.name(), &name),
                    &[(variable, var_new), (&ga, ga_new), (&gga, gga_new)],
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
    fn global_step_starts_at_zero_and_advances_once_per_step() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![0.5].into_dyn());
        let loss = w.sum();
        let targets = AdaGradDA::new(AdaGradDAConfig::default())
            .unwrap()
            .prepare_targets(&ctx, &[w], &loss)
            .unwrap();

        let mut session = Session::new();
        session.initialize_graph_variables(&ctx).unwrap();
        session.initialize_optimizer_variables(&ctx).unwrap();
        assert_eq!(session.variable("optimizer_adagrad-da-global-step"), Some(&arr0(0.0).into_dyn()));
        for _ in 0..3 {
            session.run_training_step(&ctx, &targets, &HashMap::new()).unwrap();
        }
        assert_eq!(session.variable("optimizer_adagrad-da-global-step"), Some(&arr0(3.0).into_dyn()));
        assert_eq!(session.variable("optimizer_w-gradient_accumulator"), Some(&array![3.0].into_dyn()));
    }

    #[test]
    fn l1_zeroes_small_accumulated_gradients() {
        // l1 * T перекрывает |ga| на втором шаге: 0.6 - 1.0 * 1 < 0
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![2.0].into_dyn());
        let loss = (&w * 0.3).sum();
        let config = AdaGradDAConfig { learning_rate: 1.0, initial_accumulator_value: 0.0, l1_strength: 1.0, l2_strength: 0.0 };
        let targets = AdaGradDA::new(config).unwrap().prepare_targets(&ctx, &[w], &loss).unwrap();

        let mut session = Session::new();
        session.initialize_graph_variables(&ctx).unwrap();
        session.initialize_optimizer_variables(&ctx).unwrap();

        // T = 0: var = -0.3 / 0.3 = -1
        session.run_training_step(&ctx, &targets, &HashMap::new()).unwrap();
        let w1 = session.variable("w").unwrap().iter().copied().next().unwrap();
        assert!((w1 + 1.0).abs() < 1e-6, "{}", w1);

        session.run_training_step(&ctx, &targets, &HashMap::new()).unwrap();
        assert_eq!(session.variable("w"), Some(&array![0.0].into_dyn()));
    }
}
