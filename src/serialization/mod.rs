//! Модуль для сериализации весов и состояния обучения.
//!
//! - **SafeTensors**: бинарный формат для тензоров (веса, слоты оптимизатора)
//! - **JSON**: метаданные чекпоинта и конфигурация оптимизатора
//! - **Checkpoint**: полный снимок, из которого можно продолжить обучение
//!
//! # Примеры
//!
//! ```rust,ignore
//! use asg_optim::serialization::{save_safetensors, load_safetensors};
//!
//! save_safetensors("model.safetensors", &session.model_weights(&ctx))?;
//! let loaded = load_safetensors("model.safetensors")?;
//! session.restore_variables(&loaded);
//! ```

pub mod checkpoint;
pub mod safetensors_io;

pub use checkpoint::{load_checkpoint, save_checkpoint, Checkpoint, CheckpointConfig, CheckpointError, OptimizerState};
pub use safetensors_io::{list_tensors, load_safetensors, save_safetensors, SafeTensorsError};
