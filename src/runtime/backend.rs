//! Модуль, определяющий абстрактный интерфейс (трейт) для исполнительных бэкендов.

use crate::asg::{Asg, AsgId, NodeId, Value};
use ndarray::ArrayD;
use std::collections::HashMap;
use thiserror::Error;

/// Ошибки, которые могут возникнуть во время выполнения (интерпретации) графа.
/// Этот тип ошибок является общим для всех бэкендов.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Узел с ID {0} не найден в графе {1}. Проверьте, что граф был корректно построен и все узлы существуют.")]
    NodeNotFound(NodeId, AsgId),

    #[error("Несоответствие типов: операция ожидала {expected}, но получила {actual}. Проверьте типы входных данных.")]
    TypeError { expected: String, actual: String },

    #[error("Ошибка формы тензора: {0}. Проверьте размерности входных тензоров.")]
    ShapeError(String),

    #[error("Отсутствует значение для входа '{0}' (узел ID: {1}). Передайте его в feeds при вызове run().")]
    MissingInput(String, NodeId),

    #[error("Переменная '{0}' (узел ID: {1}) не инициализирована. Запустите инициализаторы перед выполнением графа.")]
    UninitializedVariable(String, NodeId),

    #[error("Операция '{0}' не реализована в текущем бэкенде.")]
    UnimplementedOperation(String),
}

/// Кэш для хранения уже вычисленных значений узлов.
/// Ключ - это (AsgId, NodeId).
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Значения переменных сессии по именам.
pub type VariableStore = HashMap<String, ArrayD<f32>>;

/// Результат одного запуска графа.
#[derive(Debug, Default)]
pub struct Execution {
    /// Значения запрошенных узлов, в порядке запроса.
    pub outputs: Vec<Value>,
    /// Записи в переменные, которые бэкенд вычислил, но не применил.
    /// Порядок соответствует порядку выполнения узлов состояния.
    pub writes: Vec<(String, ArrayD<f32>)>,
    /// Финальное состояние кэша со всеми промежуточными результатами.
    pub memo: Memo<Value>,
}

/// Трейт, определяющий общий интерфейс для исполнительной среды (бэкенда).
///
/// Бэкенд читает переменные из неизменяемого снимка `variables`: все узлы
/// одного запуска видят состояние до запуска, а записи возвращаются в
/// `Execution::writes` и применяются вызывающей стороной целиком.
pub trait Backend {
    /// Выполняет узлы `targets` (и всё, от чего они зависят).
    ///
    /// # Аргументы
    /// * `asg` - Граф для выполнения.
    /// * `targets` - Узлы, значения которых нужно вернуть.
    /// * `variables` - Снимок значений переменных.
    /// * `feeds` - Значения для узлов `Input`, по именам.
    fn run(
        &self,
        asg: &Asg,
        targets: &[NodeId],
        variables: &VariableStore,
        feeds: &HashMap<String, Value>,
    ) -> Result<Execution, RuntimeError>;
}
