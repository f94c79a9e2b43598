//! Модуль, реализующий полносвязный (линейный) слой в графовой парадигме.

use crate::nn::module::Module;
use crate::tensor::{GraphContext, Tensor};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;

/// Полносвязный слой `y = xW + b`.
///
/// Слой не хранит данных: `weights` и `bias` - дескрипторы переменных графа
/// с именами `<name>.weights` и `<name>.bias`. Начальные значения попадают
/// в инициализаторы контекста и применяются `Session::initialize_graph_variables`.
pub struct Linear {
    /// Веса формы `[in_features, out_features]`.
    pub weights: Tensor,
    /// Смещения формы `[1, out_features]`.
    pub bias: Tensor,
}

impl Linear {
    /// Создает слой и регистрирует его параметры как обучаемые.
    ///
    /// Веса инициализируются равномерно в `[-l, l]`, `l = sqrt(6 / (in + out))`
    /// (Glorot), смещения нулями.
    pub fn new<R: Rng + ?Sized>(
        context: &Rc<RefCell<GraphContext>>,
        in_features: usize,
        out_features: usize,
        name: &str,
        rng: &mut R,
    ) -> Self {
        let limit = (6.0 / (in_features + out_features) as f32).sqrt();
        let initial_weights = ArrayD::random_using(
            IxDyn(&[in_features, out_features]),
            Uniform::new_inclusive(-limit, limit),
            rng,
        );
        let initial_bias = ArrayD::zeros(IxDyn(&[1, out_features]));

        let weights = Tensor::new_parameter(context, &format!("{}.weights", name), initial_weights);
        let bias = Tensor::new_parameter(context, &format!("{}.bias", name), initial_bias);

        Self { weights, bias }
    }
}

impl Module for Linear {
    /// Строит подграф `inputs.dot(weights) + bias`.
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.dot(&self.weights) + &self.bias
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weights.clone(), self.bias.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn parameters_are_registered_with_shapes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Linear::new(&ctx, 3, 2, "dense", &mut rng);

        let x = Tensor::new_input(&ctx, "x", &[5, 3]);
        let y = layer.forward(&x);
        assert_eq!(y.shape(), Some(vec![5, 2]));

        let params = layer.parameters();
        assert_eq!(params[0].name().as_deref(), Some("dense.weights"));
        assert_eq!(params[1].shape(), Some(vec![1, 2]));
        assert_eq!(ctx.borrow().trainable_variables().len(), 2);
        assert_eq!(ctx.borrow().initializers().len(), 2);
    }
}
