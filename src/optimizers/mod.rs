//! Модуль оптимизаторов: построение узлов обновления параметров в графе.
//!
//! Оптимизатор ничего не вычисляет сам. Метод `prepare_targets` за один вызов:
//!  1. создает пустое хранилище слотов (`SlotStore`);
//!  2. строит градиенты loss по каждому параметру (`autograd::gradients`);
//!  3. вызывает `create_slots` конкретного алгоритма;
//!  4. пропускает каждый градиент через `ClipGradientAction`;
//!  5. вызывает `apply_gradients`, который возвращает по одному узлу
//!     обновления `Apply<Name>_<param>` на параметр.
//!
//! Возвращенные узлы выполняются вместе, раз за шаг, через
//! `Session::run_training_step`. Глобальное состояние (степени бет Adam,
//! счетчик шагов AdaGradDA) продвигается после них.

pub mod adadelta;
pub mod adagrad;
pub mod adagrad_da;
pub mod adam;
pub mod adamax;
pub mod clip;
pub mod config;
pub mod ftrl;
pub mod momentum;
pub mod rmsprop;
pub mod sgd;
pub mod slots;

pub use adadelta::{AdaDelta, AdaDeltaConfig};
pub use adagrad::{AdaGrad, AdaGradConfig};
pub use adagrad_da::{AdaGradDA, AdaGradDAConfig};
pub use adam::{Adam, AdamConfig};
pub use adamax::{Adamax, AdamaxConfig};
pub use clip::{ClipGradientAction, ClipGradientByAvgNorm, ClipGradientByNorm, ClipGradientByValue, NoClipGradient};
pub use config::{Algorithm, ClipConfig, OptimizerConfig};
pub use ftrl::{Ftrl, FtrlConfig};
pub use momentum::{Momentum, MomentumConfig};
pub use rmsprop::{RmsProp, RmsPropConfig};
pub use sgd::{Sgd, SgdConfig};
pub use slots::SlotStore;

use crate::asg::AsgError;
use crate::autograd::{self, AutogradError};
use crate::tensor::{GraphContext, Tensor};
use log::{debug, warn};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("{name} {value} should be {requirement}.")]
    InvalidHyperparameter {
        name: &'static str,
        value: f32,
        requirement: &'static str,
    },

    #[error("clip value {0} should be finite and > 0.")]
    InvalidClipValue(f32),

    #[error("Слот '{slot}' для переменной '{variable}' не найден. Вызов create_slots пропущен или имена не совпадают.")]
    SlotNotFound { variable: String, slot: String },

    #[error("Глобальная переменная оптимизатора '{0}' не найдена.")]
    GlobalNotFound(String),

    #[error("'{0}' не является переменной графа.")]
    NotAVariable(String),

    #[error("Список обучаемых переменных пуст.")]
    EmptyVariableList,

    #[error("Число градиентов ({gradients}) не совпадает с числом переменных ({variables}).")]
    GradientCountMismatch { variables: usize, gradients: usize },

    #[error("ASG: {0}")]
    Asg(#[from] AsgError),

    #[error("Autograd: {0}")]
    Autograd(#[from] AutogradError),

    #[error("Config: {0}")]
    Config(String),
}

pub type OptimizerResult<T> = Result<T, OptimizerError>;

pub(crate) fn require_non_negative(name: &'static str, value: f32) -> OptimizerResult<f32> {
    if value >= 0.0 {
        Ok(value)
    } else {
        Err(OptimizerError::InvalidHyperparameter { name, value, requirement: ">= 0" })
    }
}

pub(crate) fn require_open_unit(name: &'static str, value: f32) -> OptimizerResult<f32> {
    if value > 0.0 && value < 1.0 {
        Ok(value)
    } else {
        Err(OptimizerError::InvalidHyperparameter { name, value, requirement: "in (0, 1)" })
    }
}

pub(crate) fn require_non_positive(name: &'static str, value: f32) -> OptimizerResult<f32> {
    if value <= 0.0 {
        Ok(value)
    } else {
        Err(OptimizerError::InvalidHyperparameter { name, value, requirement: "<= 0" })
    }
}

/// Пары (имя переменной, переменная, градиент) в порядке `variables`.
pub(crate) fn named_pairs<'a>(
    variables: &'a [Tensor],
    gradients: &'a [Tensor],
) -> OptimizerResult<Vec<(String, &'a Tensor, &'a Tensor)>> {
    if variables.len() != gradients.len() {
        return Err(OptimizerError::GradientCountMismatch {
            variables: variables.len(),
            gradients: gradients.len(),
        });
    }
    variables
        .iter()
        .zip(gradients)
        .map(|(variable, gradient)| Ok((slots::variable_name(variable)?, variable, gradient)))
        .collect()
}

/// Общий протокол всех алгоритмов оптимизации.
///
/// Конкретный алгоритм описывает только раскладку своих слотов
/// (`create_slots`) и уравнение обновления (`apply_gradients`).
pub trait Optimizer: fmt::Debug {
    /// Идентификатор алгоритма (например, `"Adam"`).
    fn name(&self) -> &'static str;

    /// Поддерживается ли алгоритм на ускорителе. Только информационный флаг.
    fn is_running_on_gpu(&self) -> bool;

    fn clip_gradient(&self) -> &dyn ClipGradientAction;

    /// Создает слоты и глобальные переменные. По умолчанию ничего не делает.
    fn create_slots(&self, _slots: &mut SlotStore, _variables: &[Tensor]) -> OptimizerResult<()> {
        Ok(())
    }

    /// Строит по одному узлу обновления на переменную.
    ///
    /// `gradients` уже прошли через `clip_gradient()`.
    fn apply_gradients(
        &self,
        slots: &SlotStore,
        variables: &[Tensor],
        gradients: &[Tensor],
    ) -> OptimizerResult<Vec<Tensor>>;

    /// Готовит один проход оптимизации и возвращает узлы обновления
    /// в порядке `variables`.
    fn prepare_targets(
        &self,
        context: &Rc<RefCell<GraphContext>>,
        variables: &[Tensor],
        loss: &Tensor,
    ) -> OptimizerResult<Vec<Tensor>> {
        if variables.is_empty() {
            return Err(OptimizerError::EmptyVariableList);
        }
        for variable in variables {
            slots::variable_name(variable)?;
        }

        let mut slots = SlotStore::new(context);
        let gradients = autograd::gradients(loss, variables)?;
        self.create_slots(&mut slots, variables)?;

        let clip = self.clip_gradient();
        let clipped: Vec<Tensor> = gradients.iter().map(|g| clip.clip(g)).collect();
        let targets = self.apply_gradients(&slots, variables, &clipped)?;

        debug!(
            "{}: prepared {} update node(s), {} slot(s), clip = {:?}",
            self.name(),
            targets.len(),
            slots.len(),
            clip
        );
        if !self.is_running_on_gpu() {
            warn!("{} is not supported on accelerator hardware", self.name());
        }
        Ok(targets)
    }
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn is_running_on_gpu(&self) -> bool {
        (**self).is_running_on_gpu()
    }

    fn clip_gradient(&self) -> &dyn ClipGradientAction {
        (**self).clip_gradient()
    }

    fn create_slots(&self, slots: &mut SlotStore, variables: &[Tensor]) -> OptimizerResult<()> {
        (**self).create_slots(slots, variables)
    }

    fn apply_gradients(
        &self,
        slots: &SlotStore,
        variables: &[Tensor],
        gradients: &[Tensor],
    ) -> OptimizerResult<Vec<Tensor>> {
        (**self).apply_gradients(slots, variables, gradients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn hyperparameter_error_message() {
        let err = require_non_negative("learning rate", -0.5).unwrap_err();
        assert_eq!(err.to_string(), "learning rate -0.5 should be >= 0.");
        assert!(require_non_negative("epsilon", 0.0).is_ok());
        assert!(require_non_negative("epsilon", f32::NAN).is_err());
    }

    #[test]
    fn open_unit_and_non_positive_boundaries() {
        assert!(require_open_unit("beta1", 0.0).is_err());
        assert!(require_open_unit("beta1", 1.0).is_err());
        assert!(require_open_unit("beta1", 0.5).is_ok());
        assert!(require_non_positive("learning rate power", 0.0).is_ok());
        assert!(require_non_positive("learning rate power", 0.1).is_err());
    }

    #[test]
    fn prepare_rejects_empty_and_non_variable_lists() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![1.0].into_dyn());
        let loss = w.sum();
        let sgd = Sgd::new(SgdConfig::default()).unwrap();

        assert_eq!(sgd.prepare_targets(&ctx, &[], &loss).unwrap_err(), OptimizerError::EmptyVariableList);
        assert!(matches!(
            sgd.prepare_targets(&ctx, &[loss.clone()], &loss),
            Err(OptimizerError::NotAVariable(_))
        ));
    }

    #[test]
    fn gradient_count_must_match() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", array![1.0].into_dyn());
        assert_eq!(
            named_pairs(&[w], &[]).unwrap_err(),
            OptimizerError::GradientCountMismatch { variables: 1, gradients: 0 }
        );
    }
}
