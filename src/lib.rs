//! # asg-optim: graph-building gradient optimizers
//!
//! Optimizers here never touch numbers directly. Given a loss node and the
//! trainable parameters, an optimizer adds to the **Abstract Semantic Graph
//! (ASG)** everything one training step needs: gradient nodes, per-parameter
//! slot variables with their initializers, and one update node per parameter.
//! A `Session` then runs those nodes once per step.
//!
//! Algorithms: SGD, Momentum (with Nesterov), AdaGrad, AdaGradDA, AdaDelta,
//! RMSProp (plain and centered), Adam (with Nesterov), Adamax and FTRL.
//!
//! ## Usage Example
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::collections::HashMap;
//! use std::rc::Rc;
//! use asg_optim::losses::mse_loss;
//! use asg_optim::optimizers::{Adam, AdamConfig, Optimizer};
//! use asg_optim::runtime::Session;
//! use asg_optim::tensor::{GraphContext, Tensor};
//! use ndarray::array;
//!
//! let ctx = Rc::new(RefCell::new(GraphContext::new()));
//! let w = Tensor::new_parameter(&ctx, "w", array![0.0, 0.0].into_dyn());
//! let target = Tensor::new_literal(&ctx, array![1.0, -1.0].into_dyn(), "target");
//! let loss = mse_loss(&w, &target);
//!
//! let adam = Adam::new(AdamConfig { learning_rate: 0.1, ..Default::default() }).unwrap();
//! let updates = adam.prepare_targets(&ctx, &[w], &loss).unwrap();
//!
//! let mut session = Session::new();
//! session.initialize_graph_variables(&ctx).unwrap();
//! session.initialize_optimizer_variables(&ctx).unwrap();
//! for _ in 0..100 {
//!     session.run_training_step(&ctx, &updates, &HashMap::new()).unwrap();
//! }
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod losses;
pub mod nn;
pub mod optimizers;
pub mod runtime;
pub mod serialization;
pub mod tensor;
