//! Модуль для работы с форматом SafeTensors.
//!
//! Значения переменных сессии (веса модели, слоты и глобальные скаляры
//! оптимизатора) хранятся по их именам в графе. Скаляр `Value::ScalarF32`
//! записывается как тензор нулевого ранга и читается обратно как
//! `Value::Tensor` формы `[]`.

use crate::asg::Value;
use ndarray::{ArrayD, IxDyn};
use safetensors::serialize_to_file;
use safetensors::tensor::{SafeTensors, TensorView};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Ошибки при работе с SafeTensors
#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("Ошибка ввода/вывода: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Ошибка SafeTensors: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    #[error("Неподдерживаемый тип данных: {0}")]
    UnsupportedDtype(String),

    #[error("Ошибка формы тензора '{name}': форма {shape:?}, элементов {actual}")]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        actual: usize,
    },
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// Сохраняет значения в файл SafeTensors (dtype F32).
pub fn save_safetensors<P: AsRef<Path>>(path: P, tensors: &HashMap<String, Value>) -> Result<()> {
    // Байты должны жить дольше, чем TensorView, которые на них ссылаются.
    let mut storage: Vec<(&str, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, value)| {
            let array = value.as_array();
            let bytes = array.iter().flat_map(|x| x.to_le_bytes()).collect();
            (name.as_str(), array.shape().to_vec(), bytes)
        })
        .collect();
    storage.sort_by(|a, b| a.0.cmp(b.0));

    let views = storage
        .iter()
        .map(|(name, shape, bytes)| {
            let view = TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes)?;
            Ok((*name, view))
        })
        .collect::<Result<Vec<_>>>()?;

    serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}

/// Загружает тензоры из файла SafeTensors.
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Value>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut result = HashMap::new();
    for (name, tensor) in tensors.tensors() {
        let floats: Vec<f32> = match tensor.dtype() {
            safetensors::Dtype::F32 => tensor
                .data()
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            safetensors::Dtype::F64 => tensor
                .data()
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect(),
            other => return Err(SafeTensorsError::UnsupportedDtype(format!("{:?}", other))),
        };

        let shape = tensor.shape().to_vec();
        let actual = floats.len();
        let array = ArrayD::from_shape_vec(IxDyn(&shape), floats).map_err(|_| SafeTensorsError::ShapeMismatch {
            name: name.to_string(),
            shape: shape.clone(),
            actual,
        })?;
        result.insert(name.to_string(), Value::Tensor(array));
    }

    Ok(result)
}

/// Возвращает отсортированный список имен тензоров в файле SafeTensors.
pub fn list_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    let mut names: Vec<String> = tensors.names().iter().map(|s| s.to_string()).collect();
    names.sort();
    Ok(names)
}
