//! Автоград: построение узлов градиента d(loss)/d(parameter) в том же графе.
//!
//! Алгоритм:
//!  - обходим подграф, от которого зависит loss, в обратном топологическом порядке;
//!  - для узлов, где есть dL/dY, считаем вклады в операнды и аккумулируем (суммируем);
//!  - узлы градиента добавляются в тот же граф, поэтому они ссылаются на значения
//!    прямого прохода напрямую и вычисляются в одном запуске с обновлениями.
//!
//! Поддержка операторов:
//!  Add/Subtract, Multiply/Divide, Power (показатель - константа), MatrixMultiply (2D),
//!  Negate, Abs, Exp, Log, Sqrt, ReLU, Sigmoid, Clamp,
//!  Sum, Mean, Transpose, Broadcast, ReduceSumTo.
//!  Сравнения, Sign, Maximum/Minimum и узлы состояния дают нулевую производную.
//!
//! Параметр, от которого loss не зависит, получает нулевой градиент своей формы.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{AsgError, NodeId, NodeType};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("Shape: {0}")]
    Shape(#[from] ShapeInferenceError),
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Строит по одному градиенту на параметр, в порядке `parameters`.
pub fn gradients(loss: &Tensor, parameters: &[Tensor]) -> AutogradResult<Vec<Tensor>> {
    let mut autograd = Autograd::new(&loss.context);
    autograd.build(loss.node_id)?;

    parameters
        .iter()
        .map(|param| match autograd.gmap.get(&param.node_id) {
            Some(&g) => Ok(Tensor::from_node(&loss.context, g)),
            None => {
                let shape = param
                    .shape()
                    .ok_or(AutogradError::Asg(AsgError::InvalidShape(param.node_id)))?;
                Ok(Tensor::fill(&loss.context, None, &shape, 0.0))
            }
        })
        .collect()
}

// --------------------------- Реализация автограда ---------------------------

struct Autograd<'a> {
    context: &'a Rc<RefCell<GraphContext>>,
    /// Карта: исходный узел -> узел его градиента
    gmap: HashMap<NodeId, NodeId>,
}

impl<'a> Autograd<'a> {
    fn new(context: &'a Rc<RefCell<GraphContext>>) -> Self {
        Self { context, gmap: HashMap::new() }
    }

    /// Построить узлы градиента для `loss_id` (seed = 1.0).
    fn build(&mut self, loss_id: NodeId) -> AutogradResult<()> {
        // Снимок прямого подграфа: дальше граф будет расти за счёт узлов градиента.
        let forward: Vec<(NodeId, NodeType)> = {
            let ctx = self.context.borrow();
            let graph = ctx.main_graph();
            ShapeInference::topological_sort_from(graph, &[loss_id])?
                .into_iter()
                .map(|id| graph.get_node(id).map(|n| (id, n.node_type.clone())))
                .collect::<Result<_, _>>()?
        };

        let g_loss = self.lit_scalar(1.0);
        self.gmap.insert(loss_id, g_loss);

        for (id, node_type) in forward.iter().rev() {
            let g_out = match self.gmap.get(id).copied() {
                Some(g) => g,
                None => continue,
            };

            match node_type {
                // Листья и состояние: градиент дальше не распространяется
                NodeType::Input { .. }
                | NodeType::Variable { .. }
                | NodeType::Literal(_)
                | NodeType::Fill { .. }
                | NodeType::Assign { .. }
                | NodeType::AssignAdd { .. }
                | NodeType::Update { .. } => {}

                // -------- БИНАРНЫЕ --------
                NodeType::Add(a, b) => {
                    let ra = self.reduce_to(g_out, *a);
                    self.acc(*a, ra);
                    let rb = self.reduce_to(g_out, *b);
                    self.acc(*b, rb);
                }
                NodeType::Subtract(a, b) => {
                    let ra = self.reduce_to(g_out, *a);
                    self.acc(*a, ra);
                    let neg = self.add_node(NodeType::Negate(g_out));
                    let rb = self.reduce_to(neg, *b);
                    self.acc(*b, rb);
                }
                NodeType::Multiply(a, b) => {
                    let g_a = self.add_node(NodeType::Multiply(g_out, *b));
                    let g_b = self.add_node(NodeType::Multiply(g_out, *a));
                    let ra = self.reduce_to(g_a, *a);
                    self.acc(*a, ra);
                    let rb = self.reduce_to(g_b, *b);
                    self.acc(*b, rb);
                }
                NodeType::Divide(a, b) => {
                    // g_a = g_out / b
                    let g_a = self.add_node(NodeType::Divide(g_out, *b));
                    // g_b = - g_out * a / (b^2)
                    let b2 = self.add_node(NodeType::Multiply(*b, *b));
                    let num = self.add_node(NodeType::Multiply(g_out, *a));
                    let g_b_div = self.add_node(NodeType::Divide(num, b2));
                    let g_b = self.add_node(NodeType::Negate(g_b_div));
                    let ra = self.reduce_to(g_a, *a);
                    self.acc(*a, ra);
                    let rb = self.reduce_to(g_b, *b);
                    self.acc(*b, rb);
                }
                NodeType::Power(a, b) => {
                    // da: g * b * a^(b-1); показатель считаем константой
                    let one = self.lit_scalar(1.0);
                    let b_minus_one = self.add_node(NodeType::Subtract(*b, one));
                    let a_pow = self.add_node(NodeType::Power(*a, b_minus_one));
                    let term_da = self.add_node(NodeType::Multiply(*b, a_pow));
                    let g_a = self.add_node(NodeType::Multiply(g_out, term_da));
                    let ra = self.reduce_to(g_a, *a);
                    self.acc(*a, ra);
                }
                NodeType::MatrixMultiply(a, b) => {
                    // g_a = g_out @ b^T
                    let bt = self.add_node(NodeType::Transpose(*b, 0, 1));
                    let g_a = self.add_node(NodeType::MatrixMultiply(g_out, bt));
                    // g_b = a^T @ g_out
                    let at = self.add_node(NodeType::Transpose(*a, 0, 1));
                    let g_b = self.add_node(NodeType::MatrixMultiply(at, g_out));
                    self.acc(*a, g_a);
                    self.acc(*b, g_b);
                }

                // -------- УНАРНЫЕ --------
                NodeType::Negate(x) => {
                    let g_x = self.add_node(NodeType::Negate(g_out));
                    self.acc(*x, g_x);
                }
                NodeType::Abs(x) => {
                    let sign = self.add_node(NodeType::Sign(*x));
                    let g_x = self.add_node(NodeType::Multiply(g_out, sign));
                    self.acc(*x, g_x);
                }
                NodeType::Exp(x) => {
                    // значение узла и есть exp(x)
                    let g_x = self.add_node(NodeType::Multiply(g_out, *id));
                    self.acc(*x, g_x);
                }
                NodeType::Log(x) => {
                    let g_x = self.add_node(NodeType::Divide(g_out, *x));
                    self.acc(*x, g_x);
                }
                NodeType::Sqrt(x) => {
                    let two = self.lit_scalar(2.0);
                    let denom = self.add_node(NodeType::Multiply(two, *id));
                    let g_x = self.add_node(NodeType::Divide(g_out, denom));
                    self.acc(*x, g_x);
                }
                NodeType::ReLU(x) => {
                    let zero = self.lit_scalar(0.0);
                    let mask = self.add_node(NodeType::GreaterThan(*x, zero));
                    let g_x = self.add_node(NodeType::Multiply(g_out, mask));
                    self.acc(*x, g_x);
                }
                NodeType::Sigmoid(x) => {
                    let one = self.lit_scalar(1.0);
                    let one_minus_sig = self.add_node(NodeType::Subtract(one, *id));
                    let term = self.add_node(NodeType::Multiply(*id, one_minus_sig));
                    let g_x = self.add_node(NodeType::Multiply(g_out, term));
                    self.acc(*x, g_x);
                }
                NodeType::Clamp(x, min, max) => {
                    // пропускаем градиент только внутри (min, max)
                    let lo = self.lit_scalar(*min);
                    let hi = self.lit_scalar(*max);
                    let above = self.add_node(NodeType::GreaterThan(*x, lo));
                    let below = self.add_node(NodeType::GreaterThan(hi, *x));
                    let mask = self.add_node(NodeType::Multiply(above, below));
                    let g_x = self.add_node(NodeType::Multiply(g_out, mask));
                    self.acc(*x, g_x);
                }
                NodeType::Sign(_)
                | NodeType::GreaterThan(_, _)
                | NodeType::Maximum(_, _)
                | NodeType::Minimum(_, _) => {}

                // -------- РЕДУКЦИИ --------
                NodeType::Sum(x) => {
                    let g_x = self.add_node(NodeType::Broadcast(g_out, *x));
                    self.acc(*x, g_x);
                }
                NodeType::Mean(x) => {
                    let n = self.element_count(*x)? as f32;
                    let inv_n = self.lit_scalar(1.0 / n);
                    let scaled = self.add_node(NodeType::Multiply(g_out, inv_n));
                    let g_x = self.add_node(NodeType::Broadcast(scaled, *x));
                    self.acc(*x, g_x);
                }

                // -------- ТРАНСФОРМАЦИИ --------
                NodeType::Transpose(x, a1, a2) => {
                    let g_x = self.add_node(NodeType::Transpose(g_out, *a2, *a1));
                    self.acc(*x, g_x);
                }
                NodeType::Broadcast(x, _target) => {
                    let g_x = self.add_node(NodeType::ReduceSumTo(g_out, *x));
                    self.acc(*x, g_x);
                }
                NodeType::ReduceSumTo(x, _target) => {
                    let g_x = self.add_node(NodeType::Broadcast(g_out, *x));
                    self.acc(*x, g_x);
                }
            }
        }

        Ok(())
    }

    /// Добавить новый узел в граф.
    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.context.borrow_mut().add_node(None, node_type)
    }

    /// Литерал-скаляр.
    fn lit_scalar(&mut self, v: f32) -> NodeId {
        Tensor::scalar(self.context, v).node_id
    }

    /// Аккумуляция: dL/d(target) += contrib
    fn acc(&mut self, target: NodeId, contrib: NodeId) {
        if let Some(prev) = self.gmap.get(&target).copied() {
            let sum = self.add_node(NodeType::Add(prev, contrib));
            self.gmap.insert(target, sum);
        } else {
            self.gmap.insert(target, contrib);
        }
    }

    /// Привести градиент `g` к форме источника (ReduceSumTo по бродкаст-осям).
    fn reduce_to(&mut self, g: NodeId, src_id: NodeId) -> NodeId {
        self.add_node(NodeType::ReduceSumTo(g, src_id))
    }

    /// Число элементов источника (нужна статическая форма).
    fn element_count(&self, src_id: NodeId) -> AutogradResult<usize> {
        let ctx = self.context.borrow();
        let shape = ctx
            .main_graph()
            .get_node(src_id)?
            .shape
            .clone()
            .ok_or(AutogradError::Asg(AsgError::InvalidShape(src_id)))?;
        Ok(shape.iter().product())
    }
}
