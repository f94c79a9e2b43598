//! FTRL-proximal с L1, L2 и L2-shrinkage регуляризацией.
//!
//! ```text
//! p      = -lr_power
//! g_s    = g + 2 * l2_shrinkage * var
//! n      = acc + g^2
//! linear = linear + g_s - (n^p - acc^p) / lr * var
//! x      = clamp(linear, -l1, l1) - linear
//! y      = n^p / lr + 2 * l2
//! var    = x / y
//! acc    = n
//! ```
//!
//! Квадрат градиента в аккумуляторе берется от `g`, а не от `g_s`.

use super::clip::{ClipGradientAction, NoClipGradient};
use super::slots::{apply_name, SlotStore};
use super::{named_pairs, require_non_negative, require_non_positive, Optimizer, OptimizerResult};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub const GRADIENT_ACCUMULATOR_SLOT: &str = "gradient_accumulator";
pub const LINEAR_ACCUMULATOR_SLOT: &str = "linear_accumulator";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtrlConfig {
    pub learning_rate: f32,
    pub l1_strength: f32,
    pub l2_strength: f32,
    pub learning_rate_power: f32,
    pub l2_shrinkage_regularization_strength: f32,
    pub initial_accumulator_value: f32,
}

impl Default for FtrlConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            l1_strength: 0.0,
            l2_strength: 0.0,
            learning_rate_power: -0.5,
            l2_shrinkage_regularization_strength: 0.0,
            initial_accumulator_value: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct Ftrl {
    config: FtrlConfig,
    clip: Box<dyn ClipGradientAction>,
}

impl Ftrl {
    pub fn new(config: FtrlConfig) -> OptimizerResult<Self> {
        require_non_negative("learning rate", config.learning_rate)?;
        require_non_negative("l1 strength", config.l1_strength)?;
        require_non_negative("l2 strength", config.l2_strength)?;
        require_non_positive("learning rate power", config.learning_rate_power)?;
        require_non_negative(
            "l2 shrinkage regularization strength",
            config.l2_shrinkage_regularization_strength,
        )?;
        require_non_negative("initial accumulator value", config.initial_accumulator_value)?;
        Ok(Self { config, clip: Box::new(NoClipGradient) })
    }

    pub fn with_clip_gradient(mut self, clip: impl ClipGradientAction + 'static) -> Self {
        self.clip = Box::new(clip);
        self
    }

    pub fn config(&self) -> &FtrlConfig {
        &self.config
    }

    /// `x^(-lr_power)`; при `lr_power = -0.5` через `sqrt`.
    fn learning_rate_power(&self, x: &Tensor) -> Tensor {
        let power = -self.config.learning_rate_power;
        if power == 0.5 {
            x.sqrt()
        } else {
            x.pow_scalar(power)
        }
    }
}

impl Optimizer for Ftrl {
    fn name(&self) -> &'static str {
        "Ftrl"
    }

    fn is_running_on_gpu(&self) -> bool {
        false
    }

    fn clip_gradient(&self) -> &dyn ClipGradientAction {
        self.clip.as_ref()
    }

    fn create_slots(&self, slots: &mut SlotStore, variables: &[Tensor]) -> OptimizerResult<()> {
        for variable in variables {
            slots.create_filled_slot(variable, GRADIENT_ACCUMULATOR_SLOT, self.config.initial_accumulator_value)?;
            slots.create_filled_slot(variable, LINEAR_ACCUMULATOR_SLOT, 0.0)?;
        }
        Ok(())
    }

    fn apply_gradients(
        &self,
        slots: &SlotStore,
        variables: &[Tensor],
        gradients: &[Tensor],
    ) -> OptimizerResult<Vec<Tensor>> {
        let FtrlConfig {
            learning_rate: lr,
            l1_strength: l1,
            l2_strength: l2,
            l2_shrinkage_regularization_strength: shrinkage,
            ..
        } = self.config;

        named_pairs(variables, gradients)?
            .into_iter()
            .map(|(name, variable, g)| {
                let acc = slots.get_slot(&name, GRADIENT_ACCUMULATOR_SLOT)?;
                let linear = slots.get_slot(&name, LINEAR_ACCUMULATOR_SLOT)?;

                let g_shrunk = if shrinkage > 0.0 {
                    g + variable * (2.0 * shrinkage)
                } else {
                    g.clone()
                };
                let acc_new = &acc + g.square();
                let acc_new_pow = self.learning_rate_power(&acc_new);
                let sigma = (&acc_new_pow - self.learning_rate_power(&acc)) / lr;
                let linear_new = &linear + g_shrunk - sigma * variable;

                let x = linear_new.clamp(-l1, l1) - &linear_new;
                let y = acc_new_pow / lr + 2.0 * l2;
                let var_new = x / y;

                Ok(Tensor::update(
                    slots.context(),
                    &apply_name(self.name(), &name),
                    &[(variable, var_new), (&acc, acc_new), (&linear, linear_new)],
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

    fn read(session: &Session, name: &str) -> f32 {
        session.variable(name).unwrap().iter().copied().next().unwrap()
    }

    #[test]
    fn learning_rate_power_must_not_be_positive() {
        let err = Ftrl::new(FtrlConfig { learning_rate_power: 0.5, ..Default::default() }).unwrap_err();
        assert_eq!(err.to_string(), "learning rate power 0.5 should be <= 0.");
        assert!(Ftrl::new(FtrlConfig { learning_rate_power: 0.0, ..Default::default() }).is_ok());
    }

    #[test]
    fn l1_keeps_variable_at_zero_for_small_linear_term() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![0.0].into_dyn());
        let loss = (&w * 0.5).sum();
        let config = FtrlConfig { learning_rate: 1.0, l1_strength: 1.0, initial_accumulator_value: 1.0, ..Default::default() };
        let targets = Ftrl::new(config).unwrap().prepare_targets(&ctx, &[w], &loss).unwrap();

        let mut session = Session::new();
        session.initialize_graph_variables(&ctx).unwrap();
        session.initialize_optimizer_variables(&ctx).unwrap();
        session.run_training_step(&ctx, &targets, &HashMap::new()).unwrap();

        // linear = 0.5, |linear| <= l1, var = 0
        assert!((read(&session, "optimizer_w-linear_accumulator") - 0.5).abs() < 1e-6);
        assert!((read(&session, "optimizer_w-gradient_accumulator") - 1.25).abs() < 1e-6);
        assert_eq!(read(&session, "w"), 0.0);
    }

    #[test]
    fn shrinkage_enters_linear_term_but_not_accumulator() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![1.0].into_dyn());
        let loss = w.sum();
        let config = FtrlConfig {
            learning_rate: 1.0,
            l2_shrinkage_regularization_strength: 0.5,
            initial_accumulator_value: 3.0,
            ..Default::default()
        };
        let targets = Ftrl::new(config).unwrap().prepare_targets(&ctx, &[w], &loss).unwrap();

        let mut session = Session::new();
        session.initialize_graph_variables(&ctx).unwrap();
        session.initialize_optimizer_variables(&ctx).unwrap();
        session.run_training_step(&ctx, &targets, &HashMap::new()).unwrap();

        // g_s = 1 + 2 * 0.5 * 1 = 2, n = 3 + 1 = 4
        // linear = 2 - (sqrt(4) - sqrt(3)) * 1, var = -linear / sqrt(4)
        let linear = 2.0 - (2.0 - 3.0f32.sqrt());
        assert!((read(&session, "optimizer_w-gradient_accumulator") - 4.0).abs() < 1e-6);
        assert!((read(&session, "optimizer_w-linear_accumulator") - linear).abs() < 1e-6);
        assert!((read(&session, "w") + linear / 2.0).abs() < 1e-6);
    }
}
