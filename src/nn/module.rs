//! Module defining the `Module` trait for model components.

use crate::tensor::Tensor;

/// A component that adds a pattern of operations and parameters to the graph.
///
/// `parameters()` is the ordered trainable-variable list an optimizer
/// prepares its update nodes for.
pub trait Module {
    /// Builds the forward pass for `inputs` and returns its output node.
    fn forward(&self, inputs: &Tensor) -> Tensor;

    /// Trainable parameters of this module, in a stable order.
    fn parameters(&self) -> Vec<Tensor>;
}
