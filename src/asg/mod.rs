//! ASG: Абстрактный семантический граф
//!
//! Граф хранит не только вычисления, но и состояние обучения: узлы `Variable`
//! ссылаются на изменяемые тензоры сессии, а `Assign`/`AssignAdd`/`Update`
//! описывают их изменение.

use ndarray::{arr0, ArrayD};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Идентификатор узла
pub type NodeId = usize;
/// Идентификатор графа
pub type AsgId = usize;
/// Форма тензора
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("Узел с ID {0} не найден")]
    NodeNotFound(NodeId),
    #[error("Неверная форма у узла {0}")]
    InvalidShape(NodeId),
    #[error("Узел {0} не является переменной")]
    NotAVariable(NodeId),
    #[error("Операция не поддерживается: {0}")]
    UnsupportedOperation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// ID узла (дублируем ключ HashMap для удобства вызовов в других модулях)
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Данные
    Input { name: String },
    /// Изменяемый тензор, значение которого живёт в сессии под именем `name`.
    Variable { name: String, shape: Shape },
    Literal(Value),
    Fill { shape: Shape, value: f32 },

    // Бинарные (с numpy-бродкастингом)
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    Power(NodeId, NodeId),
    Maximum(NodeId, NodeId),
    Minimum(NodeId, NodeId),
    GreaterThan(NodeId, NodeId),
    MatrixMultiply(NodeId, NodeId),

    // Унарные
    Negate(NodeId),
    Abs(NodeId),
    Sign(NodeId),
    Sqrt(NodeId),
    Exp(NodeId),
    Log(NodeId),
    ReLU(NodeId),
    Sigmoid(NodeId),
    Clamp(NodeId, f32, f32),

    // Редукции по всем элементам, результат - скаляр
    Sum(NodeId),
    Mean(NodeId),

    // Трансформации
    Transpose(NodeId, usize, usize),
    Broadcast(NodeId, NodeId),
    ReduceSumTo(NodeId, NodeId),

    // Состояние
    Assign { variable: NodeId, value: NodeId },
    AssignAdd { variable: NodeId, delta: NodeId },
    /// Атомарное обновление: все новые значения считаются по состоянию
    /// до выполнения узла, затем записываются вместе.
    Update { assignments: Vec<(NodeId, NodeId)> },
}

impl NodeType {
    /// Узлы, от которых зависит значение этого узла.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. }
            | NodeType::Variable { .. }
            | NodeType::Literal(_)
            | NodeType::Fill { .. } => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::Divide(a, b)
            | NodeType::Power(a, b)
            | NodeType::Maximum(a, b)
            | NodeType::Minimum(a, b)
            | NodeType::GreaterThan(a, b)
            | NodeType::MatrixMultiply(a, b)
            | NodeType::Broadcast(a, b)
            | NodeType::ReduceSumTo(a, b) => vec![*a, *b],

            NodeType::Negate(a)
            | NodeType::Abs(a)
            | NodeType::Sign(a)
            | NodeType::Sqrt(a)
            | NodeType::Exp(a)
            | NodeType::Log(a)
            | NodeType::ReLU(a)
            | NodeType::Sigmoid(a)
            | NodeType::Clamp(a, _, _)
            | NodeType::Sum(a)
            | NodeType::Mean(a)
            | NodeType::Transpose(a, _, _) => vec![*a],

            NodeType::Assign { variable, value } => vec![*variable, *value],
            NodeType::AssignAdd { variable, delta } => vec![*variable, *delta],
            NodeType::Update { assignments } => assignments
                .iter()
                .flat_map(|(variable, value)| [*variable, *value])
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    /// Приводит значение к тензору (скаляр становится 0-мерным массивом).
    pub fn into_array(self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr,
            Value::ScalarF32(v) => arr0(v).into_dyn(),
        }
    }

    pub fn as_array(&self) -> ArrayD<f32> {
        self.clone().into_array()
    }

    pub fn shape(&self) -> Shape {
        match self {
            Value::Tensor(arr) => arr.shape().to_vec(),
            Value::ScalarF32(_) => vec![],
        }
    }

    /// Первый элемент значения; удобно для скалярных результатов (loss, счётчики).
    pub fn first(&self) -> Option<f32> {
        match self {
            Value::Tensor(arr) => arr.iter().next().copied(),
            Value::ScalarF32(v) => Some(*v),
        }
    }
}

impl From<ArrayD<f32>> for Value {
    fn from(arr: ArrayD<f32>) -> Self {
        Value::Tensor(arr)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub name: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId, name: Option<String>) -> Self {
        Self { id, name, nodes: HashMap::new(), inputs: vec![], outputs: vec![] }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let mut node = Node { id: new_id, name, node_type, shape: None };

        // Листья с известной формой размечаем сразу
        node.shape = match &node.node_type {
            NodeType::Literal(value) => Some(value.shape()),
            NodeType::Variable { shape, .. } | NodeType::Fill { shape, .. } => Some(shape.clone()),
            _ => None,
        };

        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_inputs(&mut self, inputs: Vec<NodeId>) { self.inputs = inputs; }
    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) { self.outputs = outputs; }

    /// Шорткат для проектов, где вызывается `set_output(node_id)`.
    pub fn set_output(&mut self, output: NodeId) {
        self.set_outputs(vec![output]);
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }
    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Имя переменной, на которую ссылается узел `Variable`.
    pub fn variable_name(&self, id: NodeId) -> AsgResult<&str> {
        match &self.get_node(id)?.node_type {
            NodeType::Variable { name, .. } => Ok(name),
            _ => Err(AsgError::NotAVariable(id)),
        }
    }

    /// Последний добавленный узел `Variable` с данным именем.
    pub fn find_variable(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|n| matches!(&n.node_type, NodeType::Variable { name: v, .. } if v == name))
            .map(|n| n.id)
            .max()
    }

    /// Узлы с заданным именем в порядке добавления.
    pub fn nodes_named(&self, name: &str) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.name.as_deref() == Some(name))
            .map(|n| n.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_get_static_shapes() {
        let mut g = Asg::new(0, None);
        let v = g.add_node(Some("w".into()), NodeType::Variable { name: "w".into(), shape: vec![2, 3] });
        let s = g.add_node(None, NodeType::Literal(Value::ScalarF32(1.0)));
        let f = g.add_node(None, NodeType::Fill { shape: vec![4], value: 0.0 });
        assert_eq!(g.get_node(v).unwrap().shape, Some(vec![2, 3]));
        assert_eq!(g.get_node(s).unwrap().shape, Some(vec![]));
        assert_eq!(g.get_node(f).unwrap().shape, Some(vec![4]));
        assert_eq!(g.variable_name(v).unwrap(), "w");
        assert_eq!(g.variable_name(s), Err(AsgError::NotAVariable(s)));
        assert_eq!(g.find_variable("w"), Some(v));
    }

    #[test]
    fn update_operands_follow_assignment_order() {
        let update = NodeType::Update { assignments: vec![(0, 5), (1, 6)] };
        assert_eq!(update.operands(), vec![0, 5, 1, 6]);
    }
}
