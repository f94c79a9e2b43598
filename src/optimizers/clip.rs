//! Преобразования градиента перед обновлением (clipping).
//!
//! Каждое действие только строит узлы графа и сохраняет форму градиента.

use super::{OptimizerError, OptimizerResult};
use crate::tensor::Tensor;
use std::fmt;

/// Преобразование "сырого" градиента в тот, что пойдёт в уравнение обновления.
pub trait ClipGradientAction: fmt::Debug {
    fn clip(&self, gradient: &Tensor) -> Tensor;
}

impl<C: ClipGradientAction + ?Sized> ClipGradientAction for Box<C> {
    fn clip(&self, gradient: &Tensor) -> Tensor {
        (**self).clip(gradient)
    }
}

fn require_clip_value(value: f32) -> OptimizerResult<f32> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(OptimizerError::InvalidClipValue(value))
    }
}

/// Градиент без изменений (тот же узел).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NoClipGradient;

impl ClipGradientAction for NoClipGradient {
    fn clip(&self, gradient: &Tensor) -> Tensor {
        gradient.clone()
    }
}

/// Поэлементное ограничение значением: `clamp(g, -v, v)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipGradientByValue {
    clip_value: f32,
}

impl ClipGradientByValue {
    pub fn new(clip_value: f32) -> OptimizerResult<Self> {
        Ok(Self { clip_value: require_clip_value(clip_value)? })
    }

    pub fn clip_value(&self) -> f32 {
        self.clip_value
    }
}

impl ClipGradientAction for ClipGradientByValue {
    fn clip(&self, gradient: &Tensor) -> Tensor {
        gradient.clamp(-self.clip_value, self.clip_value)
    }
}

/// Ограничение L2-нормы: `g * c / max(||g||, c)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipGradientByNorm {
    clip_norm: f32,
}

impl ClipGradientByNorm {
    pub fn new(clip_norm: f32) -> OptimizerResult<Self> {
        Ok(Self { clip_norm: require_clip_value(clip_norm)? })
    }

    pub fn clip_norm(&self) -> f32 {
        self.clip_norm
    }
}

impl ClipGradientAction for ClipGradientByNorm {
    fn clip(&self, gradient: &Tensor) -> Tensor {
        let l2norm = gradient.square().sum().sqrt();
        let clip_norm = Tensor::scalar(&gradient.context, self.clip_norm);
        gradient * self.clip_norm / l2norm.maximum(&clip_norm)
    }
}

/// Ограничение средней L2-нормы (норма, деленная на число элементов):
/// `g * min(c * n / ||g||, 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipGradientByAvgNorm {
    clip_norm: f32,
}

impl ClipGradientByAvgNorm {
    pub fn new(clip_norm: f32) -> OptimizerResult<Self> {
        Ok(Self { clip_norm: require_clip_value(clip_norm)? })
    }

    pub fn clip_norm(&self) -> f32 {
        self.clip_norm
    }
}

impl ClipGradientAction for ClipGradientByAvgNorm {
    fn clip(&self, gradient: &Tensor) -> Tensor {
        let n = gradient.shape().map_or(1, |s| s.iter().product::<usize>()) as f32;
        let l2norm = gradient.square().sum().sqrt();
        let one = Tensor::scalar(&gradient.context, 1.0);
        let scale = (self.clip_norm * n / l2norm).minimum(&one);
        gradient * scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use crate::runtime::Session;
    use crate::tensor::GraphContext;
    use ndarray::{array, ArrayD};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn clip_values(action: &dyn ClipGradientAction, g: ArrayD<f32>) -> ArrayD<f32> {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let g = Tensor::new_literal(&ctx, g, "g");
        let clipped = action.clip(&g);
        assert_eq!(clipped.shape(), g.shape());
        let out = Session::new().run(&ctx, [&clipped], &HashMap::new()).unwrap();
        match out.into_iter().next() {
            Some(Value::Tensor(arr)) => arr,
            other => panic!("unexpected output {:?}", other),
        }
    }

    fn assert_close(actual: &ArrayD<f32>, expected: &ArrayD<f32>) {
        assert_eq!(actual.shape(), expected.shape());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-5, "{} != {}", a, e);
        }
    }

    #[test]
    fn no_clip_returns_the_same_node() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let g = Tensor::scalar(&ctx, 3.0);
        assert_eq!(NoClipGradient.clip(&g).node_id, g.node_id);
    }

    #[test]
    fn by_value_clamps_elementwise() {
        let clip = ClipGradientByValue::new(0.5).unwrap();
        let out = clip_values(&clip, array![-2.0, 0.25, 3.0].into_dyn());
        assert_close(&out, &array![-0.5, 0.25, 0.5].into_dyn());
    }

    #[test]
    fn by_norm_rescales_only_large_gradients() {
        let clip = ClipGradientByNorm::new(1.0).unwrap();
        // ||(3, 4)|| = 5
        let out = clip_values(&clip, array![3.0, 4.0].into_dyn());
        assert_close(&out, &array![0.6, 0.8].into_dyn());

        let small = clip_values(&clip, array![0.3, 0.4].into_dyn());
        assert_close(&small, &array![0.3, 0.4].into_dyn());
    }

    #[test]
    fn by_avg_norm_uses_element_count() {
        let clip = ClipGradientByAvgNorm::new(1.0).unwrap();
        // avg norm = 5 / 2 = 2.5 > 1, scale = 1 * 2 / 5
        let out = clip_values(&clip, array![3.0, 4.0].into_dyn());
        assert_close(&out, &array![1.2, 1.6].into_dyn());
    }

    #[test]
    fn clip_thresholds_must_be_positive_and_finite() {
        assert!(ClipGradientByValue::new(0.0).is_err());
        assert!(ClipGradientByNorm::new(-1.0).is_err());
        assert!(ClipGradientByAvgNorm::new(f32::INFINITY).is_err());
        assert!(ClipGradientByValue::new(f32::NAN).is_err());
    }
}
