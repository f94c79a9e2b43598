//! Module for shape inference (Shape Inference).
//!
//! Determines the shape of the output tensor for each node based on
//! its input shapes and operation type. Element type is always `f32`.

use crate::asg::{Asg, AsgError, Node, NodeId, NodeType, Shape};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': left operand {shape1:?}, right operand {shape2:?}. \
             Ensure dimensions are compatible for broadcasting or matrix multiplication.")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}. \
             This may mean the node has not been processed by shape inference yet or the graph contains a cyclic dependency.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Add the shape to the initial_shapes HashMap when calling ShapeInference::run().")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D. \
             Check input data dimensions.")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Broadcast error: cannot broadcast shapes {0:?} and {1:?} to a common shape.")]
    BroadcastError(Shape, Shape),
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Structure that performs shape inference for ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Runs the shape inference process for every node reachable from the outputs.
    ///
    /// Modifies the graph in-place, filling in the `shape` field for each node.
    /// `initial_shapes` overrides the shapes of `Input` nodes (key is the input name).
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, Shape>) -> Result<()> {
        let roots: Vec<NodeId> = if asg.outputs.is_empty() {
            let mut all: Vec<NodeId> = asg.nodes.keys().copied().collect();
            all.sort_unstable();
            all
        } else {
            asg.outputs.clone()
        };
        let sorted_nodes = Self::topological_sort_from(asg, &roots)?;

        for node_id in sorted_nodes {
            let node = asg.get_node(node_id)?;
            let shape = match &node.node_type {
                NodeType::Input { name } => match initial_shapes.get(name) {
                    Some(shape) => shape.clone(),
                    None => Self::infer_node_shape(asg, node)?,
                },
                _ => Self::infer_node_shape(asg, node)?,
            };
            asg.get_node_mut(node_id)?.shape = Some(shape);
        }

        Ok(())
    }

    /// Shape inference for a single node, assuming its operands already carry shapes.
    pub fn infer_node_shape(asg: &Asg, node: &Node) -> Result<Shape> {
        match &node.node_type {
            NodeType::Input { name } => node
                .shape
                .clone()
                .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone())),

            NodeType::Variable { shape, .. } | NodeType::Fill { shape, .. } => Ok(shape.clone()),
            NodeType::Literal(value) => Ok(value.shape()),

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::Power(l, r)
            | NodeType::Maximum(l, r)
            | NodeType::Minimum(l, r)
            | NodeType::GreaterThan(l, r) => {
                let ls = Self::get_shape(asg, *l)?;
                let rs = Self::get_shape(asg, *r)?;
                Self::broadcast_shapes(&ls, &rs)
            }

            NodeType::MatrixMultiply(l, r) => {
                let ls = Self::get_shape(asg, *l)?;
                let rs = Self::get_shape(asg, *r)?;

                if ls.len() != 2 || rs.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: if ls.len() != 2 { ls.len() } else { rs.len() },
                    });
                }
                if ls[1] != rs[0] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "MatrixMultiply".to_string(),
                        shape1: ls,
                        shape2: rs,
                    });
                }
                Ok(vec![ls[0], rs[1]])
            }

            // Element-wise operations - shape unchanged
            NodeType::Negate(id)
            | NodeType::Abs(id)
            | NodeType::Sign(id)
            | NodeType::Sqrt(id)
            | NodeType::Exp(id)
            | NodeType::Log(id)
            | NodeType::ReLU(id)
            | NodeType::Sigmoid(id)
            | NodeType::Clamp(id, _, _) => Self::get_shape(asg, *id),

            NodeType::Sum(_) | NodeType::Mean(_) => Ok(vec![]),

            NodeType::Transpose(id, axis1, axis2) => {
                let mut shape = Self::get_shape(asg, *id)?;
                if *axis1 >= shape.len() || *axis2 >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: axis1.max(axis2) + 1,
                        actual: shape.len(),
                    });
                }
                shape.swap(*axis1, *axis2);
                Ok(shape)
            }

            NodeType::Broadcast(_, target_id) | NodeType::ReduceSumTo(_, target_id) => {
                Self::get_shape(asg, *target_id)
            }

            // Assignments evaluate to the value written into the variable.
            NodeType::Assign { variable, .. } | NodeType::AssignAdd { variable, .. } => {
                Self::get_shape(asg, *variable)
            }
            NodeType::Update { assignments } => match assignments.first() {
                Some((variable, _)) => Self::get_shape(asg, *variable),
                None => Ok(vec![]),
            },
        }
    }

    /// Numpy-style broadcasting of two shapes.
    pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Shape> {
        let rank = a.len().max(b.len());
        let mut out = Vec::with_capacity(rank);
        for i in 0..rank {
            let da = if i + a.len() < rank { 1 } else { a[i + a.len() - rank] };
            let db = if i + b.len() < rank { 1 } else { b[i + b.len() - rank] };
            let dim = if da == db || db == 1 {
                da
            } else if da == 1 {
                db
            } else {
                return Err(ShapeInferenceError::BroadcastError(a.to_vec(), b.to_vec()));
            };
            out.push(dim);
        }
        Ok(out)
    }

    /// Helper function to get an already computed shape for a node.
    fn get_shape(asg: &Asg, node_id: NodeId) -> Result<Shape> {
        asg.get_node(node_id)?
            .shape
            .clone()
            .ok_or(ShapeInferenceError::MissingShapeInfo(node_id))
    }

    /// Performs topological sort of the part of the graph reachable from its outputs.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        Self::topological_sort_from(asg, &asg.outputs)
    }

    /// Topological sort of everything the given roots depend on (roots included).
    pub fn topological_sort_from(asg: &Asg, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        for root in roots {
            Self::build_sorted_graph(*root, asg, &mut visited, &mut sorted)?;
        }
        Ok(sorted)
    }

    fn build_sorted_graph(
        node_id: NodeId,
        asg: &Asg,
        visited: &mut HashSet<NodeId>,
        sorted: &mut Vec<NodeId>,
    ) -> Result<()> {
        if visited.contains(&node_id) {
            return Ok(());
        }

        let node = asg.get_node(node_id)?;
        for input_id in node.node_type.operands() {
            Self::build_sorted_graph(input_id, asg, visited, sorted)?;
        }

        if visited.insert(node_id) {
            sorted.push(node_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;

    #[test]
    fn broadcasting_follows_numpy_rules() {
        assert_eq!(ShapeInference::broadcast_shapes(&[2, 3], &[]).unwrap(), vec![2, 3]);
        assert_eq!(ShapeInference::broadcast_shapes(&[4, 1], &[3]).unwrap(), vec![4, 3]);
        assert_eq!(ShapeInference::broadcast_shapes(&[1], &[5, 2]).unwrap(), vec![5, 2]);
        assert!(matches!(
            ShapeInference::broadcast_shapes(&[2, 3], &[4]),
            Err(ShapeInferenceError::BroadcastError(_, _))
        ));
    }

    #[test]
    fn run_fills_shapes_for_reachable_nodes() {
        let mut g = Asg::new(0, None);
        let x = g.add_node(None, NodeType::Input { name: "x".into() });
        let w = g.add_node(None, NodeType::Variable { name: "w".into(), shape: vec![3, 2] });
        let y = g.add_node(None, NodeType::MatrixMultiply(x, w));
        let two = g.add_node(None, NodeType::Literal(Value::ScalarF32(2.0)));
        let z = g.add_node(None, NodeType::Multiply(y, two));
        let s = g.add_node(None, NodeType::Sum(z));
        g.set_output(s);

        let shapes = HashMap::from([("x".to_string(), vec![5, 3])]);
        ShapeInference::run(&mut g, &shapes).unwrap();

        assert_eq!(g.get_node(z).unwrap().shape, Some(vec![5, 2]));
        assert_eq!(g.get_node(s).unwrap().shape, Some(vec![]));
    }

    #[test]
    fn topological_order_puts_operands_first() {
        let mut g = Asg::new(0, None);
        let a = g.add_node(None, NodeType::Fill { shape: vec![2], value: 1.0 });
        let b = g.add_node(None, NodeType::Sqrt(a));
        let c = g.add_node(None, NodeType::Add(b, a));
        let order = ShapeInference::topological_sort_from(&g, &[c]).unwrap();
        assert_eq!(order, vec![a, b, c]);
    }
}
