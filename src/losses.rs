//! Loss builders used to drive the optimizers.
//!
//! Each function adds the nodes for a scalar loss to the graph of its inputs.
//! Predictions and targets broadcast like any elementwise op.

use crate::tensor::Tensor;

/// `sum((y_pred - y_true)^2)`
pub fn mse_loss(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    (y_pred - y_true).square().sum()
}

/// `mean((y_pred - y_true)^2)`
pub fn mse_loss_mean(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    (y_pred - y_true).square().mean()
}

/// `sum(|y_pred - y_true|)`
pub fn l1_loss(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    (y_pred - y_true).abs().sum()
}

/// `mean(|y_pred - y_true|)`
pub fn l1_loss_mean(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    (y_pred - y_true).abs().mean()
}
