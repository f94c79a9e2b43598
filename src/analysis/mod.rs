//! # Graph Analysis Module
//!
//! This module contains analysis passes that process the ASG before execution.
//!
//! ## Available Passes
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): Propagates tensor shapes
//!   through the graph, detecting shape mismatches before runtime. The graph
//!   context runs it eagerly for every node it adds, so optimizers can size
//!   their slots from the parameter shapes.
//!
//! ## Example
//!
//! ```ignore
//! use asg_optim::analysis::shape_inference::ShapeInference;
//!
//! let mut graph = context.borrow().main_graph().clone();
//! graph.set_output(loss.node_id);
//!
//! // Provide shapes for inputs
//! let shapes = HashMap::from([("input".to_string(), vec![32, 784])]);
//! ShapeInference::run(&mut graph, &shapes)?;
//! ```

pub mod shape_inference;
