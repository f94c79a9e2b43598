//! Хранилище слотов: вспомогательное состояние оптимизатора на каждый параметр.
//!
//! `SlotStore` создается заново на каждую подготовку прохода и передается
//! в `create_slots` по `&mut`, а в `apply_gradients` по `&`. Имена слотов в
//! графе выводятся детерминированно из имени параметра и имени слота.

use super::{OptimizerError, OptimizerResult};
use crate::tensor::{GraphContext, Tensor};
use log::trace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Префикс всех переменных оптимизатора.
pub const OPTIMIZER_PREFIX: &str = "optimizer_";

/// `optimizer_<name>`
pub fn optimizer_variable_name(name: &str) -> String {
    format!("{}{}", OPTIMIZER_PREFIX, name)
}

/// `optimizer_<parameter>-<slot>`
pub fn slot_variable_name(variable_name: &str, slot_name: &str) -> String {
    optimizer_variable_name(&format!("{}-{}", variable_name, slot_name))
}

/// Узел начального значения переменной: `Init_<variable>`.
pub fn initializer_name(variable_name: &str) -> String {
    format!("Init_{}", variable_name)
}

/// Присваивание начального значения: `Assign_<variable>`.
pub fn assign_name(variable_name: &str) -> String {
    format!("Assign_{}", variable_name)
}

/// Узел обновления параметра: `Apply<Optimizer>_<parameter>`.
pub fn apply_name(optimizer_name: &str, variable_name: &str) -> String {
    format!("Apply{}_{}", optimizer_name, variable_name)
}

/// Имя переменной графа, на которую указывает дескриптор.
pub fn variable_name(variable: &Tensor) -> OptimizerResult<String> {
    let ctx = variable.context.borrow();
    match ctx.main_graph().variable_name(variable.node_id) {
        Ok(name) => Ok(name.to_string()),
        Err(_) => Err(OptimizerError::NotAVariable(
            variable.name().unwrap_or_else(|| format!("#{}", variable.node_id)),
        )),
    }
}

pub struct SlotStore {
    context: Rc<RefCell<GraphContext>>,
    /// slot name -> (variable name -> slot)
    slots: HashMap<String, HashMap<String, Tensor>>,
    /// Глобальные скаляры оптимизатора по короткому имени.
    globals: HashMap<String, Tensor>,
}

impl SlotStore {
    pub fn new(context: &Rc<RefCell<GraphContext>>) -> Self {
        Self {
            context: Rc::clone(context),
            slots: HashMap::new(),
            globals: HashMap::new(),
        }
    }

    pub fn context(&self) -> &Rc<RefCell<GraphContext>> {
        &self.context
    }

    /// Создает слот формы `variable`, инициализируемый значением `initializer`.
    ///
    /// Присваивание начального значения попадает в список инициализаторов
    /// оптимизатора, сам слот - в список его переменных. Повторный вызов
    /// для того же ключа создаст дубликат узла; хранилище это не проверяет.
    pub fn create_slot(&mut self, variable: &Tensor, slot_name: &str, initializer: &Tensor) -> OptimizerResult<Tensor> {
        let var_name = variable_name(variable)?;
        let shape = variable
            .shape()
            .ok_or_else(|| OptimizerError::NotAVariable(var_name.clone()))?;
        let slot_var_name = slot_variable_name(&var_name, slot_name);

        let slot = Tensor::new_variable(&self.context, &slot_var_name, &shape);
        let assign = slot.assign_named(initializer, &assign_name(&slot_var_name));
        {
            let mut ctx = self.context.borrow_mut();
            ctx.register_optimizer_initializer(assign.node_id);
            ctx.register_optimizer_variable(slot.node_id);
        }
        trace!("created slot '{}' with shape {:?}", slot_var_name, shape);

        self.slots
            .entry(slot_name.to_string())
            .or_default()
            .insert(var_name, slot.clone());
        Ok(slot)
    }

    /// Слот, заполненный константой `value`.
    pub fn create_filled_slot(&mut self, variable: &Tensor, slot_name: &str, value: f32) -> OptimizerResult<Tensor> {
        let var_name = variable_name(variable)?;
        let shape = variable
            .shape()
            .ok_or_else(|| OptimizerError::NotAVariable(var_name.clone()))?;
        let init_name = initializer_name(&slot_variable_name(&var_name, slot_name));
        let initializer = Tensor::fill(&self.context, Some(&init_name), &shape, value);
        self.create_slot(variable, slot_name, &initializer)
    }

    pub fn get_slot(&self, variable_name: &str, slot_name: &str) -> OptimizerResult<Tensor> {
        self.slots
            .get(slot_name)
            .and_then(|by_variable| by_variable.get(variable_name))
            .cloned()
            .ok_or_else(|| OptimizerError::SlotNotFound {
                variable: variable_name.to_string(),
                slot: slot_name.to_string(),
            })
    }

    /// Скалярная переменная оптимизатора `optimizer_<name>`.
    pub fn create_global(&mut self, name: &str, initial_value: f32) -> Tensor {
        let var_name = optimizer_variable_name(name);
        let global = Tensor::new_variable(&self.context, &var_name, &[]);
        let init = Tensor::fill(&self.context, Some(&initializer_name(&var_name)), &[], initial_value);
        let assign = global.assign_named(&init, &assign_name(&var_name));
        {
            let mut ctx = self.context.borrow_mut();
            ctx.register_optimizer_initializer(assign.node_id);
            ctx.register_optimizer_variable(global.node_id);
        }
        trace!("created optimizer global '{}' = {}", var_name, initial_value);

        self.globals.insert(name.to_string(), global.clone());
        global
    }

    pub fn get_global(&self, name: &str) -> OptimizerResult<Tensor> {
        self.globals
            .get(name)
            .cloned()
            .ok_or_else(|| OptimizerError::GlobalNotFound(name.to_string()))
    }

    /// Регистрирует узел, продвигающий глобальную переменную раз за шаг.
    pub fn register_step_update(&mut self, global: &Tensor, update: &Tensor) -> OptimizerResult<()> {
        let name = variable_name(global)?;
        self.context
            .borrow_mut()
            .register_optimizer_step_update(&name, update.node_id);
        Ok(())
    }

    /// Имена всех слотов в графе, отсортированные.
    pub fn slot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .values()
            .flat_map(|by_variable| by_variable.values())
            .filter_map(Tensor::name)
            .collect();
        names.sort();
        names
    }

    /// Количество слотов (без глобальных переменных).
    pub fn len(&self) -> usize {
        self.slots.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.globals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn naming_follows_optimizer_conventions() {
        assert_eq!(slot_variable_name("dense_1_kernel", "m"), "optimizer_dense_1_kernel-m");
        assert_eq!(optimizer_variable_name("beta1_power"), "optimizer_beta1_power");
        assert_eq!(initializer_name("optimizer_w-m"), "Init_optimizer_w-m");
        assert_eq!(assign_name("optimizer_w-m"), "Assign_optimizer_w-m");
        assert_eq!(apply_name("Adam", "w"), "ApplyAdam_w");
    }

    #[test]
    fn created_slot_is_registered_and_retrievable() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", ArrayD::zeros(IxDyn(&[2, 3])));
        let mut store = SlotStore::new(&ctx);

        let slot = store.create_filled_slot(&w, "accumulator", 0.1).unwrap();
        assert_eq!(slot.shape(), Some(vec![2, 3]));
        assert_eq!(slot.name().as_deref(), Some("optimizer_w-accumulator"));
        assert_eq!(store.get_slot("w", "accumulator").unwrap().node_id, slot.node_id);
        assert_eq!(store.len(), 1);

        let c = ctx.borrow();
        assert_eq!(c.optimizer_variables(), &[slot.node_id]);
        assert_eq!(c.optimizer_initializers().len(), 1);
    }

    #[test]
    fn missing_slot_is_reported() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let store = SlotStore::new(&ctx);
        assert_eq!(
            store.get_slot("w", "m").unwrap_err(),
            OptimizerError::SlotNotFound { variable: "w".into(), slot: "m".into() }
        );
        assert_eq!(
            store.get_global("beta1_power").unwrap_err(),
            OptimizerError::GlobalNotFound("beta1_power".into())
        );
    }

    #[test]
    fn slots_require_graph_variables() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let not_a_variable = Tensor::scalar(&ctx, 1.0);
        let mut store = SlotStore::new(&ctx);
        assert!(matches!(
            store.create_filled_slot(&not_a_variable, "m", 0.0),
            Err(OptimizerError::NotAVariable(_))
        ));
    }
}
