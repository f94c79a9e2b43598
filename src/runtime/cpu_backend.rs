//! Модуль, реализующий бэкенд для выполнения ASG на CPU.
//!
//! Этот бэкенд рекурсивно вычисляет запрошенные узлы графа и для каждого
//! выполняет соответствующую операцию с помощью `ndarray`. Узлы состояния
//! (`Assign`, `AssignAdd`, `Update`) не меняют переменные на месте, а
//! накапливают записи, которые сессия применяет после запуска.

use super::backend::{Backend, Execution, Memo, RuntimeError, VariableStore};
use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{Asg, NodeId, NodeType, Shape, Value};
use ndarray::{arr0, ArrayD, Axis, Ix2, IxDyn, Zip};
use std::collections::HashMap;

/// Контекст выполнения одного запуска на CPU.
struct ExecutionContext<'a> {
    asg: &'a Asg,
    variables: &'a VariableStore,
    feeds: &'a HashMap<String, Value>,
    /// Кэш для уже вычисленных значений узлов.
    memo: Memo<Value>,
    /// Отложенные записи в переменные.
    writes: Vec<(String, ArrayD<f32>)>,
}

impl<'a> ExecutionContext<'a> {
    fn new(asg: &'a Asg, variables: &'a VariableStore, feeds: &'a HashMap<String, Value>) -> Self {
        Self { asg, variables, feeds, memo: Memo::new(), writes: Vec::new() }
    }

    /// Главная функция, которая рекурсивно вычисляет значение для заданного узла.
    fn evaluate_node(&mut self, node_id: NodeId) -> Result<ArrayD<f32>, RuntimeError> {
        if let Some(value) = self.memo.get(&(self.asg.id, node_id)) {
            return Ok(value.as_array());
        }

        let node = self
            .asg
            .nodes
            .get(&node_id)
            .ok_or(RuntimeError::NodeNotFound(node_id, self.asg.id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => self
                .feeds
                .get(name)
                .map(Value::as_array)
                .ok_or_else(|| RuntimeError::MissingInput(name.clone(), node.id)),
            NodeType::Variable { name, shape } => {
                let value = self
                    .variables
                    .get(name)
                    .ok_or_else(|| RuntimeError::UninitializedVariable(name.clone(), node.id))?;
                if value.shape() != shape.as_slice() {
                    return Err(RuntimeError::ShapeError(format!(
                        "variable '{}' is declared as {:?} but holds {:?}",
                        name,
                        shape,
                        value.shape()
                    )));
                }
                Ok(value.clone())
            }
            NodeType::Literal(value) => Ok(value.as_array()),
            NodeType::Fill { shape, value } => Ok(ArrayD::from_elem(IxDyn(shape), *value)),

            NodeType::Add(l, r) | NodeType::Subtract(l, r) | NodeType::Multiply(l, r) |
            NodeType::Divide(l, r) | NodeType::Power(l, r) | NodeType::Maximum(l, r) |
            NodeType::Minimum(l, r) | NodeType::GreaterThan(l, r) | NodeType::MatrixMultiply(l, r) |
            NodeType::Broadcast(l, r) | NodeType::ReduceSumTo(l, r) => {
                let lhs = self.evaluate_node(*l)?;
                let rhs = self.evaluate_node(*r)?;
                match &node.node_type {
                    NodeType::Add(_, _) => zip_with(&lhs, &rhs, |a, b| a + b),
                    NodeType::Subtract(_, _) => zip_with(&lhs, &rhs, |a, b| a - b),
                    NodeType::Multiply(_, _) => zip_with(&lhs, &rhs, |a, b| a * b),
                    NodeType::Divide(_, _) => zip_with(&lhs, &rhs, |a, b| a / b),
                    NodeType::Power(_, _) => zip_with(&lhs, &rhs, f32::powf),
                    NodeType::Maximum(_, _) => zip_with(&lhs, &rhs, f32::max),
                    NodeType::Minimum(_, _) => zip_with(&lhs, &rhs, f32::min),
                    NodeType::GreaterThan(_, _) => {
                        zip_with(&lhs, &rhs, |a, b| if a > b { 1.0 } else { 0.0 })
                    }
                    NodeType::MatrixMultiply(_, _) => op_matmul(lhs, rhs),
                    NodeType::Broadcast(_, _) => op_broadcast(lhs, rhs.shape()),
                    NodeType::ReduceSumTo(_, _) => op_reduce_sum_to(lhs, rhs.shape()),
                    _ => unreachable!(),
                }
            }

            NodeType::Negate(op) | NodeType::Abs(op) | NodeType::Sign(op) | NodeType::Sqrt(op) |
            NodeType::Exp(op) | NodeType::Log(op) | NodeType::ReLU(op) | NodeType::Sigmoid(op) |
            NodeType::Sum(op) | NodeType::Mean(op) => {
                let a = self.evaluate_node(*op)?;
                Ok(match &node.node_type {
                    NodeType::Negate(_) => a.mapv(|x| -x),
                    NodeType::Abs(_) => a.mapv(f32::abs),
                    // signum(0.0) == 1.0, а нам нужен 0
                    NodeType::Sign(_) => a.mapv(|x| if x > 0.0 { 1.0 } else if x < 0.0 { -1.0 } else { 0.0 }),
                    NodeType::Sqrt(_) => a.mapv(f32::sqrt),
                    NodeType::Exp(_) => a.mapv(f32::exp),
                    NodeType::Log(_) => a.mapv(f32::ln),
                    NodeType::ReLU(_) => a.mapv(|x| x.max(0.0)),
                    NodeType::Sigmoid(_) => a.mapv(|x| 1.0 / (1.0 + (-x).exp())),
                    NodeType::Sum(_) => arr0(a.sum()).into_dyn(),
                    NodeType::Mean(_) => arr0(a.sum() / a.len() as f32).into_dyn(),
                    _ => unreachable!(),
                })
            }

            NodeType::Clamp(op, min_val, max_val) => {
                let a = self.evaluate_node(*op)?;
                Ok(a.mapv(|x| x.clamp(*min_val, *max_val)))
            }

            NodeType::Transpose(op, ax1, ax2) => {
                let a = self.evaluate_node(*op)?;
                op_transpose(a, *ax1, *ax2)
            }

            NodeType::Assign { variable, value } => {
                let (name, shape) = self.variable_meta(*variable)?;
                let new_value = self.evaluate_node(*value)?;
                let new_value = fit_to(new_value, &shape, &name)?;
                self.writes.push((name, new_value.clone()));
                Ok(new_value)
            }

            NodeType::AssignAdd { variable, delta } => {
                let (name, shape) = self.variable_meta(*variable)?;
                let current = self.evaluate_node(*variable)?;
                let delta = self.evaluate_node(*delta)?;
                let new_value = fit_to(zip_with(&current, &delta, |a, b| a + b)?, &shape, &name)?;
                self.writes.push((name, new_value.clone()));
                Ok(new_value)
            }

            NodeType::Update { assignments } => {
                // Сначала все новые значения (по снимку), затем записи группой.
                let mut staged = Vec::with_capacity(assignments.len());
                for (variable, value) in assignments {
                    let (name, shape) = self.variable_meta(*variable)?;
                    let new_value = self.evaluate_node(*value)?;
                    staged.push((name.clone(), fit_to(new_value, &shape, &name)?));
                }
                let first = staged
                    .first()
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| arr0(0.0).into_dyn());
                self.writes.extend(staged);
                Ok(first)
            }
        }?;

        self.memo.insert((self.asg.id, node_id), Value::Tensor(result.clone()));
        Ok(result)
    }

    fn variable_meta(&self, id: NodeId) -> Result<(String, Shape), RuntimeError> {
        let node = self
            .asg
            .nodes
            .get(&id)
            .ok_or(RuntimeError::NodeNotFound(id, self.asg.id))?;
        match &node.node_type {
            NodeType::Variable { name, shape } => Ok((name.clone(), shape.clone())),
            other => Err(RuntimeError::TypeError {
                expected: "Variable".to_string(),
                actual: format!("{:?}", other),
            }),
        }
    }
}

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self { Self }
}

impl Default for CpuBackend {
    fn default() -> Self { Self::new() }
}

impl Backend for CpuBackend {
    fn run(
        &self,
        asg: &Asg,
        targets: &[NodeId],
        variables: &VariableStore,
        feeds: &HashMap<String, Value>,
    ) -> Result<Execution, RuntimeError> {
        let mut context = ExecutionContext::new(asg, variables, feeds);

        let mut outputs = Vec::with_capacity(targets.len());
        for &target in targets {
            outputs.push(Value::Tensor(context.evaluate_node(target)?));
        }

        Ok(Execution { outputs, writes: context.writes, memo: context.memo })
    }
}

/// Поэлементная операция с numpy-бродкастингом.
fn zip_with(
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    f: impl Fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>, RuntimeError> {
    let shape = ShapeInference::broadcast_shapes(a.shape(), b.shape())
        .map_err(|e| RuntimeError::ShapeError(e.to_string()))?;
    let av = a
        .broadcast(shape.as_slice())
        .ok_or_else(|| RuntimeError::ShapeError(format!("Cannot broadcast {:?} to {:?}", a.shape(), shape)))?;
    let bv = b
        .broadcast(shape.as_slice())
        .ok_or_else(|| RuntimeError::ShapeError(format!("Cannot broadcast {:?} to {:?}", b.shape(), shape)))?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

/// Приводит записываемое значение к объявленной форме переменной.
fn fit_to(value: ArrayD<f32>, shape: &[usize], name: &str) -> Result<ArrayD<f32>, RuntimeError> {
    if value.shape() == shape {
        return Ok(value);
    }
    value
        .broadcast(shape)
        .map(|v| v.to_owned())
        .ok_or_else(|| RuntimeError::ShapeError(format!(
            "cannot assign value of shape {:?} to variable '{}' of shape {:?}",
            value.shape(),
            name,
            shape
        )))
}

fn op_transpose(a: ArrayD<f32>, axis1: usize, axis2: usize) -> Result<ArrayD<f32>, RuntimeError> {
    if axis1 >= a.ndim() || axis2 >= a.ndim() {
        return Err(RuntimeError::ShapeError(format!(
            "Transpose axes ({}, {}) out of range for {:?}",
            axis1,
            axis2,
            a.shape()
        )));
    }
    let mut axes: Vec<_> = (0..a.ndim()).collect();
    axes.swap(axis1, axis2);
    Ok(a.permuted_axes(axes))
}

fn op_matmul(a: ArrayD<f32>, b: ArrayD<f32>) -> Result<ArrayD<f32>, RuntimeError> {
    let a_mat = a
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("Matmul lhs {:?}: {}", a.shape(), e)))?;
    let b_mat = b
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("Matmul rhs {:?}: {}", b.shape(), e)))?;
    if a_mat.shape()[1] != b_mat.shape()[0] {
        return Err(RuntimeError::ShapeError(format!(
            "Incompatible matmul shapes: {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(a_mat.dot(&b_mat).into_dyn())
}

fn op_broadcast(source: ArrayD<f32>, target_shape: &[usize]) -> Result<ArrayD<f32>, RuntimeError> {
    // Если source - скаляр, заполняем target_shape этим значением
    if source.len() == 1 {
        let val = source.iter().next().copied().unwrap_or_default();
        return Ok(ArrayD::from_elem(IxDyn(target_shape), val));
    }
    source
        .broadcast(target_shape)
        .map(|v| v.to_owned())
        .ok_or_else(|| RuntimeError::ShapeError(format!(
            "Cannot broadcast {:?} to {:?}",
            source.shape(),
            target_shape
        )))
}

fn op_reduce_sum_to(source: ArrayD<f32>, target_shape: &[usize]) -> Result<ArrayD<f32>, RuntimeError> {
    let mut source_tensor = source;
    let target_rank = target_shape.len();

    if source_tensor.ndim() < target_rank {
        return Err(RuntimeError::ShapeError(format!(
            "Cannot reduce {:?} to higher rank {:?}",
            source_tensor.shape(),
            target_shape
        )));
    }

    // Лишние ведущие оси суммируем целиком
    while source_tensor.ndim() > target_rank {
        source_tensor = source_tensor.sum_axis(Axis(0));
    }

    // Оси, растянутые из 1
    for axis in (0..target_rank).rev() {
        if target_shape[axis] == 1 && source_tensor.shape()[axis] > 1 {
            source_tensor = source_tensor.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }

    if source_tensor.shape() != target_shape {
        return Err(RuntimeError::ShapeError(format!(
            "Cannot reduce {:?} to {:?}",
            source_tensor.shape(),
            target_shape
        )));
    }
    Ok(source_tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn run_single(asg: &Asg, target: NodeId, variables: &VariableStore) -> Execution {
        CpuBackend::new().run(asg, &[target], variables, &HashMap::new()).unwrap()
    }

    #[test]
    fn binary_ops_broadcast_scalars_and_rows() {
        let mut g = Asg::new(0, None);
        let m = g.add_node(None, NodeType::Literal(Value::Tensor(array![[1.0, 2.0], [3.0, 4.0]].into_dyn())));
        let row = g.add_node(None, NodeType::Literal(Value::Tensor(array![10.0, 20.0].into_dyn())));
        let two = g.add_node(None, NodeType::Literal(Value::ScalarF32(2.0)));
        let sum = g.add_node(None, NodeType::Add(m, row));
        let scaled = g.add_node(None, NodeType::Multiply(sum, two));

        let out = run_single(&g, scaled, &VariableStore::new());
        assert_eq!(out.outputs[0], Value::Tensor(array![[22.0, 44.0], [26.0, 48.0]].into_dyn()));
    }

    #[test]
    fn sign_of_zero_is_zero() {
        let mut g = Asg::new(0, None);
        let x = g.add_node(None, NodeType::Literal(Value::Tensor(array![-3.0, 0.0, 2.0].into_dyn())));
        let s = g.add_node(None, NodeType::Sign(x));
        let out = run_single(&g, s, &VariableStore::new());
        assert_eq!(out.outputs[0], Value::Tensor(array![-1.0, 0.0, 1.0].into_dyn()));
    }

    #[test]
    fn reduce_sum_to_collapses_broadcast_axes() {
        let source = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]].into_dyn();
        assert_eq!(op_reduce_sum_to(source.clone(), &[2]).unwrap(), array![9.0, 12.0].into_dyn());
        assert_eq!(op_reduce_sum_to(source.clone(), &[3, 1]).unwrap(), array![[3.0], [7.0], [11.0]].into_dyn());
        assert_eq!(op_reduce_sum_to(source, &[]).unwrap(), arr0(21.0).into_dyn());
    }

    #[test]
    fn update_reads_snapshot_and_defers_writes() {
        let mut g = Asg::new(0, None);
        let a = g.add_node(None, NodeType::Variable { name: "a".into(), shape: vec![] });
        let b = g.add_node(None, NodeType::Variable { name: "b".into(), shape: vec![] });
        let one = g.add_node(None, NodeType::Literal(Value::ScalarF32(1.0)));
        let a_plus = g.add_node(None, NodeType::Add(a, one));
        let b_from_a = g.add_node(None, NodeType::Multiply(a, b));
        let update = g.add_node(None, NodeType::Update { assignments: vec![(a, a_plus), (b, b_from_a)] });

        let variables = VariableStore::from([
            ("a".to_string(), arr0(2.0).into_dyn()),
            ("b".to_string(), arr0(5.0).into_dyn()),
        ]);
        let out = run_single(&g, update, &variables);

        // b считается по старому a
        assert_eq!(out.writes, vec![
            ("a".to_string(), arr0(3.0).into_dyn()),
            ("b".to_string(), arr0(10.0).into_dyn()),
        ]);
        assert_eq!(out.outputs[0].first(), Some(3.0));
    }

    #[test]
    fn reading_uninitialized_variable_fails() {
        let mut g = Asg::new(0, None);
        let v = g.add_node(None, NodeType::Variable { name: "w".into(), shape: vec![2] });
        let err = CpuBackend::new()
            .run(&g, &[v], &VariableStore::new(), &HashMap::new())
            .unwrap_err();
        assert_eq!(err, RuntimeError::UninitializedVariable("w".into(), v));
    }

    #[test]
    fn assign_broadcasts_fill_to_declared_shape() {
        let mut g = Asg::new(0, None);
        let v = g.add_node(None, NodeType::Variable { name: "acc".into(), shape: vec![2, 2] });
        let init = g.add_node(None, NodeType::Literal(Value::ScalarF32(0.1)));
        let assign = g.add_node(None, NodeType::Assign { variable: v, value: init });
        let out = run_single(&g, assign, &VariableStore::new());
        assert_eq!(out.writes[0].1, ArrayD::from_elem(IxDyn(&[2, 2]), 0.1));
    }
}
