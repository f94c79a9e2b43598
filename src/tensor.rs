//! Модуль, определяющий `Tensor` и `GraphContext`.
//!
//! `Tensor` не является контейнером для данных. Это легковесный "дескриптор"
//! (handle), который представляет узел в `Абстрактном Семантическом Графе` (ASG).
//!
//! Все операции над тензорами (`add`, `dot` и т.д.) не выполняют вычисления
//! немедленно, а добавляют соответствующие узлы в граф.
//!
//! `GraphContext` владеет графом и служебными списками, которые нужны для
//! обучения: инициализаторы переменных модели, список обучаемых параметров,
//! а также переменные и инициализаторы, созданные оптимизатором.

use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{Asg, NodeId, NodeType, Shape, Value};
use ndarray::ArrayD;
use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

/// Контекст, который владеет и управляет построением ASG.
///
/// Этот объект обернут в `Rc<RefCell<>>`, чтобы его можно было
/// разделять между множеством `Tensor` дескрипторов.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
    /// Присваивания начальных значений переменным модели.
    initializers: Vec<NodeId>,
    /// Обучаемые параметры в порядке регистрации.
    trainable_variables: Vec<NodeId>,
    /// Присваивания начальных значений слотам и глобальным переменным оптимизатора.
    optimizer_initializers: Vec<NodeId>,
    /// Все переменные, созданные оптимизатором.
    optimizer_variables: Vec<NodeId>,
    /// Продвижение глобального состояния оптимизатора, один раз за шаг.
    /// Ключ - имя переменной, которую продвигает узел.
    optimizer_step_updates: Vec<(String, NodeId)>,
}

impl GraphContext {
    /// Создает новый, пустой контекст графа.
    pub fn new() -> Self {
        Self {
            main_graph: Asg::new(0, Some("main".to_string())),
            initializers: Vec::new(),
            trainable_variables: Vec::new(),
            optimizer_initializers: Vec::new(),
            optimizer_variables: Vec::new(),
            optimizer_step_updates: Vec::new(),
        }
    }

    /// Получает изменяемую ссылку на основной граф.
    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    /// Получает иммутабельную ссылку на основной граф.
    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }

    /// Добавляет узел и сразу выводит его форму, если формы операндов известны.
    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let id = self.main_graph.add_node(name, node_type);
        let inferred = self
            .main_graph
            .get_node(id)
            .ok()
            .filter(|node| node.shape.is_none())
            .and_then(|node| ShapeInference::infer_node_shape(&self.main_graph, node).ok());
        if let (Some(shape), Ok(node)) = (inferred, self.main_graph.get_node_mut(id)) {
            node.shape = Some(shape);
        }
        id
    }

    pub fn register_initializer(&mut self, assign: NodeId) {
        self.initializers.push(assign);
    }

    pub fn register_trainable_variable(&mut self, variable: NodeId) {
        self.trainable_variables.push(variable);
    }

    pub fn register_optimizer_initializer(&mut self, assign: NodeId) {
        self.optimizer_initializers.push(assign);
    }

    pub fn register_optimizer_variable(&mut self, variable: NodeId) {
        self.optimizer_variables.push(variable);
    }

    /// Регистрирует продвижение глобальной переменной оптимизатора.
    /// Повторная регистрация для той же переменной заменяет прежний узел,
    /// поэтому переменная продвигается ровно один раз за шаг.
    pub fn register_optimizer_step_update(&mut self, variable_name: &str, update: NodeId) {
        match self
            .optimizer_step_updates
            .iter_mut()
            .find(|(name, _)| name == variable_name)
        {
            Some(entry) => entry.1 = update,
            None => self.optimizer_step_updates.push((variable_name.to_string(), update)),
        }
    }

    pub fn initializers(&self) -> &[NodeId] {
        &self.initializers
    }

    pub fn trainable_variables(&self) -> &[NodeId] {
        &self.trainable_variables
    }

    pub fn optimizer_initializers(&self) -> &[NodeId] {
        &self.optimizer_initializers
    }

    pub fn optimizer_variables(&self) -> &[NodeId] {
        &self.optimizer_variables
    }

    pub fn optimizer_step_updates(&self) -> Vec<NodeId> {
        self.optimizer_step_updates.iter().map(|(_, id)| *id).collect()
    }

    /// Разрушает граф вместе со всеми служебными списками.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Символьный дескриптор, представляющий узел в графе вычислений (ASG).
///
/// Этот объект не содержит реальных данных. Он состоит из ID узла и ссылки
/// на `GraphContext`, в котором этот узел существует.
///
/// Любая операция над этим объектом приводит к добавлению нового узла в граф.
#[derive(Debug, Clone)]
pub struct Tensor {
    /// ID узла в ASG, который представляет этот тензор.
    pub node_id: NodeId,
    /// Разделяемая ссылка на контекст, в котором строится граф.
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Дескриптор для уже существующего узла.
    pub fn from_node(context: &Rc<RefCell<GraphContext>>, node_id: NodeId) -> Self {
        Self { node_id, context: Rc::clone(context) }
    }

    fn add_to(context: &Rc<RefCell<GraphContext>>, name: Option<String>, node_type: NodeType) -> Self {
        let node_id = context.borrow_mut().add_node(name, node_type);
        Self::from_node(context, node_id)
    }

    fn derive(&self, node_type: NodeType) -> Self {
        Self::add_to(&self.context, None, node_type)
    }

    /// Создает новый "входной" узел заданной формы. Значение подается при запуске.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str, shape: &[usize]) -> Self {
        let mut ctx = context.borrow_mut();
        let node_id = ctx.add_node(Some(name.to_string()), NodeType::Input { name: name.to_string() });
        let graph = ctx.main_graph_mut();
        if let Ok(node) = graph.get_node_mut(node_id) {
            node.shape = Some(shape.to_vec());
        }
        // Регистрируем этот узел как один из входов графа.
        graph.inputs.push(node_id);
        drop(ctx);
        Self::from_node(context, node_id)
    }

    /// Создает изменяемую переменную без инициализатора.
    pub fn new_variable(context: &Rc<RefCell<GraphContext>>, name: &str, shape: &[usize]) -> Self {
        Self::add_to(
            context,
            Some(name.to_string()),
            NodeType::Variable { name: name.to_string(), shape: shape.to_vec() },
        )
    }

    /// Создает обучаемый параметр: переменную, её инициализатор
    /// (`Init_<name>` / `Assign_<name>`) и запись в списке обучаемых переменных.
    pub fn new_parameter(context: &Rc<RefCell<GraphContext>>, name: &str, initial: ArrayD<f32>) -> Self {
        let variable = Self::new_variable(context, name, initial.shape());
        let init = Self::new_literal(context, initial, &format!("Init_{}", name));
        let assign = variable.assign_named(&init, &format!("Assign_{}", name));

        let mut ctx = context.borrow_mut();
        ctx.register_initializer(assign.node_id);
        ctx.register_trainable_variable(variable.node_id);
        variable
    }

    /// Создает новый узел-константу (литерал) из реальных данных.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        Self::add_to(context, Some(name.to_string()), NodeType::Literal(Value::Tensor(data)))
    }

    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        Self::add_to(context, None, NodeType::Literal(Value::ScalarF32(value)))
    }

    /// Тензор формы `shape`, заполненный `value`.
    pub fn fill(context: &Rc<RefCell<GraphContext>>, name: Option<&str>, shape: &[usize], value: f32) -> Self {
        Self::add_to(
            context,
            name.map(str::to_string),
            NodeType::Fill { shape: shape.to_vec(), value },
        )
    }

    // --- Метаданные ---

    /// Имя узла; для переменных совпадает с именем переменной.
    pub fn name(&self) -> Option<String> {
        let ctx = self.context.borrow();
        let node = ctx.main_graph().get_node(self.node_id).ok()?;
        match &node.node_type {
            NodeType::Variable { name, .. } | NodeType::Input { name } => Some(name.clone()),
            _ => node.name.clone(),
        }
    }

    /// Статически выведенная форма, если она известна.
    pub fn shape(&self) -> Option<Shape> {
        let ctx = self.context.borrow();
        ctx.main_graph().get_node(self.node_id).ok()?.shape.clone()
    }

    pub fn is_variable(&self) -> bool {
        let ctx = self.context.borrow();
        matches!(
            ctx.main_graph().get_node(self.node_id).map(|n| &n.node_type),
            Ok(NodeType::Variable { .. })
        )
    }

    // --- Математические операции ---

    pub fn pow(&self, power: &Tensor) -> Self {
        self.derive(NodeType::Power(self.node_id, power.node_id))
    }

    pub fn pow_scalar(&self, power: f32) -> Self {
        let power = Tensor::scalar(&self.context, power);
        self.pow(&power)
    }

    pub fn dot(&self, other: &Tensor) -> Self {
        self.derive(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    pub fn maximum(&self, other: &Tensor) -> Self {
        self.derive(NodeType::Maximum(self.node_id, other.node_id))
    }

    pub fn minimum(&self, other: &Tensor) -> Self {
        self.derive(NodeType::Minimum(self.node_id, other.node_id))
    }

    pub fn greater_than(&self, other: &Tensor) -> Self {
        self.derive(NodeType::GreaterThan(self.node_id, other.node_id))
    }

    pub fn abs(&self) -> Self {
        self.derive(NodeType::Abs(self.node_id))
    }

    pub fn sign(&self) -> Self {
        self.derive(NodeType::Sign(self.node_id))
    }

    pub fn sqrt(&self) -> Self {
        self.derive(NodeType::Sqrt(self.node_id))
    }

    pub fn square(&self) -> Self {
        self * self
    }

    pub fn exp(&self) -> Self {
        self.derive(NodeType::Exp(self.node_id))
    }

    pub fn log(&self) -> Self {
        self.derive(NodeType::Log(self.node_id))
    }

    pub fn clamp(&self, min: f32, max: f32) -> Self {
        self.derive(NodeType::Clamp(self.node_id, min, max))
    }

    // --- Функции активации ---

    pub fn relu(&self) -> Self {
        self.derive(NodeType::ReLU(self.node_id))
    }

    pub fn sigmoid(&self) -> Self {
        self.derive(NodeType::Sigmoid(self.node_id))
    }

    // --- Операции редукции ---

    pub fn sum(&self) -> Self {
        self.derive(NodeType::Sum(self.node_id))
    }

    pub fn mean(&self) -> Self {
        self.derive(NodeType::Mean(self.node_id))
    }

    // --- Операции трансформации ---

    pub fn transpose(&self, axis1: usize, axis2: usize) -> Self {
        self.derive(NodeType::Transpose(self.node_id, axis1, axis2))
    }

    /// Растягивает тензор до формы `like`.
    pub fn broadcast_to(&self, like: &Tensor) -> Self {
        self.derive(NodeType::Broadcast(self.node_id, like.node_id))
    }

    /// Суммирует по осям бродкастинга, возвращая тензор формы `like`.
    pub fn reduce_sum_to(&self, like: &Tensor) -> Self {
        self.derive(NodeType::ReduceSumTo(self.node_id, like.node_id))
    }

    // --- Операции над состоянием ---

    pub fn assign(&self, value: &Tensor) -> Self {
        self.derive(NodeType::Assign { variable: self.node_id, value: value.node_id })
    }

    pub fn assign_named(&self, value: &Tensor, name: &str) -> Self {
        Self::add_to(
            &self.context,
            Some(name.to_string()),
            NodeType::Assign { variable: self.node_id, value: value.node_id },
        )
    }

    pub fn assign_add(&self, delta: &Tensor) -> Self {
        self.derive(NodeType::AssignAdd { variable: self.node_id, delta: delta.node_id })
    }

    /// Узел атомарного обновления группы переменных.
    /// Пары - (переменная, новое значение); первая пара задает значение узла.
    pub fn update(context: &Rc<RefCell<GraphContext>>, name: &str, assignments: &[(&Tensor, Tensor)]) -> Self {
        let assignments = assignments
            .iter()
            .map(|(variable, value)| (variable.node_id, value.node_id))
            .collect();
        Self::add_to(context, Some(name.to_string()), NodeType::Update { assignments })
    }
}

// Реализация операторов для удобного синтаксиса `a + b`, `a * 0.5`, `1.0 - a`.

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $node:ident) => {
        impl $trait<&Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                self.derive(NodeType::$node(self.node_id, rhs.node_id))
            }
        }

        impl $trait<Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: Tensor) -> Tensor {
                self.$method(&rhs)
            }
        }

        impl $trait<&Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                (&self).$method(rhs)
            }
        }

        impl $trait<Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: Tensor) -> Tensor {
                (&self).$method(&rhs)
            }
        }

        impl $trait<f32> for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: f32) -> Tensor {
                let rhs = Tensor::scalar(&self.context, rhs);
                self.$method(&rhs)
            }
        }

        impl $trait<f32> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: f32) -> Tensor {
                (&self).$method(rhs)
            }
        }

        impl $trait<&Tensor> for f32 {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                let lhs = Tensor::scalar(&rhs.context, self);
                (&lhs).$method(rhs)
            }
        }

        impl $trait<Tensor> for f32 {
            type Output = Tensor;
            fn $method(self, rhs: Tensor) -> Tensor {
                self.$method(&rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Sub, sub, Subtract);
impl_binary_op!(Mul, mul, Multiply);
impl_binary_op!(Div, div, Divide);

impl Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        self.derive(NodeType::Negate(self.node_id))
    }
}

impl Neg for Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        -&self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn parameter_registers_initializer_and_trainable() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "dense.kernel", ArrayD::zeros(IxDyn(&[3, 2])));

        assert_eq!(w.name().as_deref(), Some("dense.kernel"));
        assert_eq!(w.shape(), Some(vec![3, 2]));
        assert!(w.is_variable());

        let c = ctx.borrow();
        assert_eq!(c.trainable_variables(), &[w.node_id]);
        assert_eq!(c.initializers().len(), 1);
        let assign = c.main_graph().get_node(c.initializers()[0]).unwrap();
        assert_eq!(assign.name.as_deref(), Some("Assign_dense.kernel"));
    }

    #[test]
    fn operators_infer_broadcast_shapes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x", &[4, 3]);
        let w = Tensor::new_variable(&ctx, "w", &[3, 2]);
        let b = Tensor::new_variable(&ctx, "b", &[2]);
        let y = &x.dot(&w) + &b;
        assert_eq!(y.shape(), Some(vec![4, 2]));
        assert_eq!((1.0 - &y * 2.0).shape(), Some(vec![4, 2]));
        assert_eq!(y.sum().shape(), Some(vec![]));
    }

    #[test]
    fn step_update_registration_is_keyed_by_variable() {
        let mut ctx = GraphContext::new();
        ctx.register_optimizer_step_update("optimizer_beta1_power", 7);
        ctx.register_optimizer_step_update("optimizer_beta2_power", 8);
        ctx.register_optimizer_step_update("optimizer_beta1_power", 9);
        assert_eq!(ctx.optimizer_step_updates(), vec![9, 8]);

        ctx.reset();
        assert!(ctx.optimizer_step_updates().is_empty());
        assert!(ctx.main_graph().nodes.is_empty());
    }
}
