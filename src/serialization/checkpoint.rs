//! Модуль для создания и загрузки чекпоинтов обучения.
//!
//! Чекпоинт включает:
//! - Веса модели (в формате SafeTensors)
//! - Состояние оптимизатора: его конфигурацию (JSON) и значения слотов
//!   и глобальных переменных по их именам в графе (SafeTensors)
//! - Метаданные обучения (эпоха, шаг, loss)
//!
//! Имена слотов детерминированы, поэтому после повторной подготовки
//! графа с теми же параметрами `Session::restore_variables` продолжает
//! обучение с того же состояния.

use super::safetensors_io::{load_safetensors, save_safetensors, SafeTensorsError};
use crate::asg::Value;
use crate::optimizers::OptimizerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_FILE: &str = "config.json";
const MODEL_FILE: &str = "model.safetensors";
const OPTIMIZER_CONFIG_FILE: &str = "optimizer.json";
const OPTIMIZER_STATE_FILE: &str = "optimizer.safetensors";

/// Ошибки при работе с чекпоинтами
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Ошибка ввода/вывода: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Ошибка SafeTensors: {0}")]
    SafeTensorsError(#[from] SafeTensorsError),

    #[error("Ошибка JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Директория чекпоинта не существует: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Файл не найден: {0}")]
    FileNotFound(PathBuf),
}

type Result<T> = std::result::Result<T, CheckpointError>;

/// Конфигурация чекпоинта
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Версия формата чекпоинта
    pub version: String,
    pub model_name: Option<String>,
    pub epoch: usize,
    /// Число выполненных шагов обучения
    pub global_step: usize,
    pub last_loss: Option<f32>,
    pub best_loss: Option<f32>,
    /// Дополнительные метаданные
    pub metadata: HashMap<String, String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            model_name: None,
            epoch: 0,
            global_step: 0,
            last_loss: None,
            best_loss: None,
            metadata: HashMap::new(),
        }
    }
}

impl CheckpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_name(mut self, name: &str) -> Self {
        self.model_name = Some(name.to_string());
        self
    }

    pub fn with_epoch(mut self, epoch: usize) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_global_step(mut self, step: usize) -> Self {
        self.global_step = step;
        self
    }

    pub fn with_last_loss(mut self, loss: f32) -> Self {
        self.last_loss = Some(loss);
        self
    }

    /// Обновляет лучший loss, если `loss` меньше текущего.
    pub fn with_best_loss(mut self, loss: f32) -> Self {
        self.best_loss = Some(self.best_loss.map_or(loss, |best| best.min(loss)));
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Состояние оптимизатора: конфигурация и значения его переменных.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub optimizer: OptimizerConfig,
    /// Слоты и глобальные переменные по именам (`optimizer_<param>-<slot>`).
    pub variables: HashMap<String, Value>,
}

impl OptimizerState {
    pub fn new(optimizer: OptimizerConfig, variables: HashMap<String, Value>) -> Self {
        Self { optimizer, variables }
    }
}

/// Полный чекпоинт обучения
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub config: CheckpointConfig,
    pub model_weights: HashMap<String, Value>,
    pub optimizer_state: Option<OptimizerState>,
}

impl Checkpoint {
    pub fn new(weights: HashMap<String, Value>, config: CheckpointConfig) -> Self {
        Self {
            config,
            model_weights: weights,
            optimizer_state: None,
        }
    }

    /// Добавляет состояние оптимизатора
    pub fn with_optimizer_state(mut self, state: OptimizerState) -> Self {
        self.optimizer_state = Some(state);
        self
    }

    /// Все сохраненные переменные (веса и состояние оптимизатора) одним словарем,
    /// в виде, который принимает `Session::restore_variables`.
    pub fn all_variables(&self) -> HashMap<String, Value> {
        let mut all = self.model_weights.clone();
        if let Some(state) = &self.optimizer_state {
            all.extend(state.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        all
    }
}

/// Сохраняет чекпоинт в директорию.
///
/// Структура директории:
/// ```text
/// checkpoint_dir/
/// ├── config.json              # Конфигурация и метаданные
/// ├── model.safetensors        # Веса модели
/// ├── optimizer.json           # Конфигурация оптимизатора (опционально)
/// └── optimizer.safetensors    # Слоты и глобальные переменные (опционально)
/// ```
pub fn save_checkpoint<P: AsRef<Path>>(path: P, checkpoint: &Checkpoint) -> Result<()> {
    let dir = path.as_ref();
    fs::create_dir_all(dir)?;

    fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&checkpoint.config)?)?;
    save_safetensors(dir.join(MODEL_FILE), &checkpoint.model_weights)?;

    if let Some(state) = &checkpoint.optimizer_state {
        fs::write(dir.join(OPTIMIZER_CONFIG_FILE), serde_json::to_string_pretty(&state.optimizer)?)?;
        save_safetensors(dir.join(OPTIMIZER_STATE_FILE), &state.variables)?;
    }

    Ok(())
}

fn require_file(path: PathBuf) -> Result<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(CheckpointError::FileNotFound(path))
    }
}

/// Загружает чекпоинт из директории.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    let dir = path.as_ref();
    if !dir.exists() {
        return Err(CheckpointError::DirectoryNotFound(dir.to_path_buf()));
    }

    let config_str = fs::read_to_string(require_file(dir.join(CONFIG_FILE))?)?;
    let config: CheckpointConfig = serde_json::from_str(&config_str)?;
    let model_weights = load_safetensors(require_file(dir.join(MODEL_FILE))?)?;

    let optimizer_path = dir.join(OPTIMIZER_CONFIG_FILE);
    let optimizer_state = if optimizer_path.exists() {
        let optimizer: OptimizerConfig = serde_json::from_str(&fs::read_to_string(&optimizer_path)?)?;
        let variables = load_safetensors(require_file(dir.join(OPTIMIZER_STATE_FILE))?)?;
        Some(OptimizerState { optimizer, variables })
    } else {
        None
    };

    Ok(Checkpoint {
        config,
        model_weights,
        optimizer_state,
    })
}
