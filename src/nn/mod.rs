//! # Model container
//!
//! Layers are constructors that add parameters and operations to the graph.
//! An optimizer prepares its update nodes for `Module::parameters()`.
//!
//! ```ignore
//! use asg_optim::nn::{Linear, Module};
//!
//! let layer = Linear::new(&ctx, 1, 1, "dense", &mut rng);
//! let y = layer.forward(&x);
//! let targets = optimizer.prepare_targets(&ctx, &layer.parameters(), &loss)?;
//! ```

pub mod linear;
pub mod module;

pub use linear::Linear;
pub use module::Module;
