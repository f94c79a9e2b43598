//! Сессия: владеет значениями переменных и исполняет узлы графа через бэкенд.
//!
//! Каждый запуск читает переменные из снимка и применяет все записи
//! после завершения вычислений. Обновления параметров одного шага
//! поэтому видят одно и то же состояние, а каждое из них применяется целиком.

use super::backend::{Backend, RuntimeError, VariableStore};
use super::cpu_backend::CpuBackend;
use crate::asg::{NodeId, Value};
use crate::tensor::{GraphContext, Tensor};
use log::{debug, warn};
use ndarray::ArrayD;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

pub struct Session<B: Backend = CpuBackend> {
    backend: B,
    variables: VariableStore,
}

impl Session<CpuBackend> {
    pub fn new() -> Self {
        Self::with_backend(CpuBackend::new())
    }
}

impl Default for Session<CpuBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Session<B> {
    pub fn with_backend(backend: B) -> Self {
        Self { backend, variables: VariableStore::new() }
    }

    pub fn set_variable(&mut self, name: &str, value: ArrayD<f32>) {
        self.variables.insert(name.to_string(), value);
    }

    pub fn variable(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    /// Загружает значения переменных по именам (например, из чекпоинта).
    pub fn restore_variables(&mut self, values: &HashMap<String, Value>) {
        for (name, value) in values {
            self.variables.insert(name.clone(), value.as_array());
        }
    }

    /// Вычисляет `targets` и применяет все записи в переменные.
    pub fn run<'t>(
        &mut self,
        context: &Rc<RefCell<GraphContext>>,
        targets: impl IntoIterator<Item = &'t Tensor>,
        feeds: &HashMap<String, Value>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let ids: Vec<NodeId> = targets.into_iter().map(|t| t.node_id).collect();
        self.run_nodes(context, &ids, feeds)
    }

    pub fn run_nodes(
        &mut self,
        context: &Rc<RefCell<GraphContext>>,
        targets: &[NodeId],
        feeds: &HashMap<String, Value>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let execution = {
            let ctx = context.borrow();
            self.backend.run(ctx.main_graph(), targets, &self.variables, feeds)?
        };

        let mut written = HashSet::new();
        for (name, _) in &execution.writes {
            if !written.insert(name.as_str()) {
                warn!("variable '{}' written more than once in a single run; last write wins", name);
            }
        }
        debug!(
            "session run: {} target(s), {} variable write(s)",
            targets.len(),
            execution.writes.len()
        );
        for (name, value) in execution.writes {
            self.variables.insert(name, value);
        }
        Ok(execution.outputs)
    }

    /// Запускает инициализаторы переменных модели.
    pub fn initialize_graph_variables(&mut self, context: &Rc<RefCell<GraphContext>>) -> Result<(), RuntimeError> {
        let initializers = context.borrow().initializers().to_vec();
        self.run_nodes(context, &initializers, &HashMap::new())?;
        Ok(())
    }

    /// Запускает инициализаторы слотов и глобальных переменных оптимизатора.
    pub fn initialize_optimizer_variables(&mut self, context: &Rc<RefCell<GraphContext>>) -> Result<(), RuntimeError> {
        let initializers = context.borrow().optimizer_initializers().to_vec();
        self.run_nodes(context, &initializers, &HashMap::new())?;
        Ok(())
    }

    /// Один шаг обучения: выполняет узлы обновления одной группой, затем
    /// продвигает глобальное состояние оптимизатора (степени бет, счетчик шагов).
    ///
    /// Возвращает значения `targets`, вычисленные до продвижения.
    pub fn run_training_step<'t>(
        &mut self,
        context: &Rc<RefCell<GraphContext>>,
        targets: impl IntoIterator<Item = &'t Tensor>,
        feeds: &HashMap<String, Value>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let outputs = self.run(context, targets, feeds)?;
        let step_updates = context.borrow().optimizer_step_updates();
        if !step_updates.is_empty() {
            self.run_nodes(context, &step_updates, feeds)?;
        }
        Ok(outputs)
    }

    /// Текущие значения всех переменных оптимизатора, по именам.
    pub fn optimizer_state(&self, context: &Rc<RefCell<GraphContext>>) -> HashMap<String, Value> {
        self.collect(context, context.borrow().optimizer_variables())
    }

    /// Текущие значения обучаемых параметров, по именам.
    pub fn model_weights(&self, context: &Rc<RefCell<GraphContext>>) -> HashMap<String, Value> {
        self.collect(context, context.borrow().trainable_variables())
    }

    fn collect(&self, context: &Rc<RefCell<GraphContext>>, ids: &[NodeId]) -> HashMap<String, Value> {
        let ctx = context.borrow();
        ids.iter()
            .filter_map(|&id| ctx.main_graph().variable_name(id).ok())
            .filter_map(|name| {
                self.variables
                    .get(name)
                    .map(|value| (name.to_string(), Value::Tensor(value.clone())))
            })
            .collect()
    }
}
