use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::rc::Rc;
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::debug;
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand_distr::StandardNormal;

use topological_sort::TopologicalSort;

pub mod convolution;
pub mod error;
pub mod graph;
pub mod operations;

pub use self::error::Error;
use self::operations::Operation;

lazy_static! {
    static ref COUNTER: Mutex<u64> = Mutex::new(0);
}

thread_local! {
    static GRADIENT_ENABLED: Cell<bool> = const { Cell::new(true) };
}

fn generate_sequential_tensor_id() -> String {
    // a poisoned counter still holds a usable count
    let mut num = COUNTER.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *num += 1;
    format!("Tensor{}", num)
}

pub fn is_gradient_enabled() -> bool {
    GRADIENT_ENABLED.with(|enabled| enabled.get())
}

/// Disables gradient tracking on this thread until the returned guard is
/// dropped. Guards nest: dropping one restores whatever mode was in effect
/// when it was created.
pub fn no_gradient() -> NoGradientGuard {
    let previous = GRADIENT_ENABLED.with(|enabled| enabled.replace(false));
    NoGradientGuard { previous }
}

#[must_use = "gradient tracking is re-enabled as soon as the guard is dropped"]
pub struct NoGradientGuard {
    previous: bool,
}

impl Drop for NoGradientGuard {
    fn drop(&mut self) {
        GRADIENT_ENABLED.with(|enabled| enabled.set(self.previous));
    }
}

pub struct Tensor {
    identifier: String,
    array: ArrayD<f32>,
    requires_gradient: bool,
    gradient: RefCell<Option<ArrayD<f32>>>,
    origin: Option<Origin>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("identifier", &self.identifier)
            .field("array", &self.array)
            .field("requires_gradient", &self.requires_gradient)
            .field("gradient", &self.gradient)
            .field("gradient_function", &self.gradient_function())
            .finish()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor({}", self.array)?;
        match self.gradient_function() {
            Some(name) => write!(f, ", grad_fn=<{}>)", name),
            None if self.requires_gradient => write!(f, ", requires_gradient=true)"),
            None => write!(f, ")"),
        }
    }
}

// Identity is the allocation, not the identifier: identifiers are labels and
// two layers built with the same name share them.
impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        ptr::hash(self, state);
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl Eq for Tensor {}

impl Tensor {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn array(&self) -> &ArrayD<f32> {
        &self.array
    }

    pub fn shape(&self) -> &[usize] {
        self.array.shape()
    }

    pub fn requires_gradient(&self) -> bool {
        self.requires_gradient
    }

    /// The first element, for single-element tensors such as losses.
    pub fn item(&self) -> f32 {
        self.array.iter().next().copied().unwrap_or(0.)
    }

    /// Euclidean norm of the values. Not recorded in the computation graph.
    pub fn norm(&self) -> f32 {
        self.array.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    pub fn gradient(&self) -> Option<ArrayD<f32>> {
        self.gradient.borrow().clone()
    }

    /// Name of the backward node that produced this tensor, if any.
    pub fn gradient_function(&self) -> Option<&'static str> {
        self.origin.as_ref().map(|origin| origin.operation.name())
    }

    pub fn is_leaf(&self) -> bool {
        self.origin.is_none()
    }

    pub fn parents(&self) -> &[Rc<Tensor>] {
        match &self.origin {
            Some(origin) => &origin.parents,
            None => &[],
        }
    }

    /// Same values, cut loose from the computation graph.
    pub fn detach(&self) -> Rc<Tensor> {
        Rc::new(TensorBuilder::new(self.array.clone()).build())
    }

    #[allow(dead_code)]
    pub fn zero_gradient(&self) {
        *self.gradient.borrow_mut() = None
    }

    fn accumulate_gradient(&self, contribution: ArrayD<f32>) {
        let mut gradient = self.gradient.borrow_mut();
        *gradient = Some(match gradient.take() {
            Some(existing) => existing + contribution,
            None => contribution,
        });
    }
}

pub struct TensorBuilder {
    array: ArrayD<f32>,
    identifier: Option<String>,
    requires_gradient: bool,
    origin: Option<Origin>,
}

impl TensorBuilder {
    pub fn new(array: ArrayD<f32>) -> TensorBuilder {
        TensorBuilder {
            array,
            identifier: None,
            requires_gradient: false,
            origin: None,
        }
    }

    pub fn from_vec(shape: &[usize], values: Vec<f32>) -> Result<TensorBuilder, Error> {
        let value_count = values.len();
        let array = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| {
            Error::ShapeMismatch {
                operation: "tensor construction",
                expected: format!("{} values", shape.iter().product::<usize>()),
                actual: vec![value_count],
            }
        })?;
        Ok(Self::new(array))
    }

    pub fn ones(shape: &[usize]) -> TensorBuilder {
        Self::new(ArrayD::ones(IxDyn(shape)))
    }

    #[allow(dead_code)]
    pub fn zeros(shape: &[usize]) -> TensorBuilder {
        Self::new(ArrayD::zeros(IxDyn(shape)))
    }

    /// Samples every element from the standard normal distribution.
    pub fn randn(shape: &[usize]) -> TensorBuilder {
        Self::new(ArrayD::random(IxDyn(shape), StandardNormal))
    }

    pub fn identifier(mut self, identifier: &str) -> TensorBuilder {
        self.identifier = Some(identifier.to_owned());
        self
    }

    pub fn requires_gradient(mut self, requires: bool) -> TensorBuilder {
        self.requires_gradient = requires;
        self
    }

    fn origin(mut self, origin: Origin) -> TensorBuilder {
        self.origin = Some(origin);
        self
    }

    pub fn build(self) -> Tensor {
        Tensor {
            array: self.array,
            identifier: match self.identifier {
                Some(identifier) => identifier,
                None => generate_sequential_tensor_id(),
            },
            requires_gradient: self.requires_gradient,
            gradient: RefCell::new(None),
            origin: self.origin,
        }
    }
}

struct Origin {
    operation: Box<dyn Operation>,
    parents: Vec<Rc<Tensor>>,
}

/// Wraps an operation's result. The result joins the computation graph only
/// when tracking is enabled and some parent requires gradient; otherwise it
/// is an untracked leaf.
fn derive(array: ArrayD<f32>, operation: Box<dyn Operation>, parents: Vec<Rc<Tensor>>) -> Rc<Tensor> {
    let tracked = is_gradient_enabled() && parents.iter().any(|parent| parent.requires_gradient);
    let mut builder = TensorBuilder::new(array);
    if tracked {
        builder = builder
            .requires_gradient(true)
            .origin(Origin { operation, parents });
    }
    Rc::new(builder.build())
}

pub trait Parameterized {
    fn identifier(&self) -> &str;
    fn parameters(&self) -> Vec<Rc<Tensor>>;

    fn parameter_count(&self) -> usize {
        self.parameters()
            .iter()
            .map(|parameter| parameter.array.len())
            .sum()
    }
}

fn register_parents(
    sorter: &mut TopologicalSort<Rc<Tensor>>,
    child: Rc<Tensor>,
    visited: &mut HashSet<*const Tensor>,
) {
    if !visited.insert(Rc::as_ptr(&child)) {
        return;
    }
    if let Some(origin) = &child.origin {
        for parent in &origin.parents {
            if !parent.requires_gradient {
                continue;
            }
            sorter.add_dependency(parent.clone(), child.clone());
            register_parents(sorter, parent.clone(), visited);
        }
    }
}

fn sorted_computation_graph(end: Rc<Tensor>) -> Vec<Rc<Tensor>> {
    let mut sorter = TopologicalSort::new();
    register_parents(&mut sorter, end, &mut HashSet::new());
    let mut sorted = sorter.collect::<Vec<_>>();
    // We actually want reverse-topological order
    sorted.reverse();
    sorted
}

/// Backpropagates from a single-element tensor, seeding with one.
pub fn backprop(culmination: Rc<Tensor>) -> Result<(), Error> {
    if culmination.array.len() != 1 {
        if !culmination.requires_gradient {
            return Err(Error::NotTracked);
        }
        return Err(Error::ImplicitGradientForNonScalar {
            shape: culmination.shape().to_vec(),
        });
    }
    let seed = Array::ones(culmination.array.raw_dim());
    backprop_with_gradient(culmination, seed)
}

/// Backpropagates an explicit upstream gradient, which must match the
/// culmination's shape. Gradients accumulate into every tracked tensor on
/// the way.
pub fn backprop_with_gradient(culmination: Rc<Tensor>, seed: ArrayD<f32>) -> Result<(), Error> {
    if !culmination.requires_gradient {
        return Err(Error::NotTracked);
    }
    if seed.shape() != culmination.shape() {
        return Err(Error::GradientShapeMismatch {
            expected: culmination.shape().to_vec(),
            actual: seed.shape().to_vec(),
        });
    }
    if culmination.origin.is_none() {
        culmination.accumulate_gradient(seed);
        return Ok(());
    }

    let mut gradients = HashMap::<*const Tensor, ArrayD<f32>>::new();
    gradients.insert(Rc::as_ptr(&culmination), seed);
    let graph = sorted_computation_graph(culmination);
    debug!("backpropagating through {} tensors", graph.len());
    for node in graph {
        let Some(gradient) = gradients.remove(&Rc::as_ptr(&node)) else {
            continue;
        };

        // If it has an origin, use the backward function to accumulate
        // gradients for the parents in our map
        if let Some(origin) = &node.origin {
            for (i, parent) in origin.parents.iter().enumerate() {
                if !parent.requires_gradient {
                    continue;
                }
                let contribution = origin
                    .operation
                    .backward(&gradient, origin.parents.clone(), i);
                match gradients.get_mut(&Rc::as_ptr(parent)) {
                    Some(gradient) => {
                        *gradient = &*gradient + contribution;
                    }
                    None => {
                        gradients.insert(Rc::as_ptr(parent), contribution);
                    }
                }
            }
        }

        node.accumulate_gradient(gradient);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::operations::{Addition, Multiplication, TensorOperations};
    use super::*;

    #[test]
    fn test_backprop() {
        let a = Rc::new(
            TensorBuilder::new(array![2.0].into_dyn())
                .identifier("a")
                .requires_gradient(true)
                .build(),
        );
        let b = Rc::new(
            TensorBuilder::new(array![3.0].into_dyn())
                .identifier("b")
                .requires_gradient(true)
                .build(),
        );
        let c = Rc::new(
            TensorBuilder::new(array![4.0].into_dyn())
                .identifier("c")
                .requires_gradient(true)
                .build(),
        );

        let mul = Multiplication {}.forward(vec![a.clone(), b.clone()]);
        let result = Addition {}.forward(vec![mul, c.clone()]);

        backprop(result).unwrap();

        assert_eq!(a.gradient().unwrap(), array![3.0].into_dyn());
        assert_eq!(b.gradient().unwrap(), array![2.0].into_dyn());
        assert_eq!(c.gradient().unwrap(), array![1.0].into_dyn());
    }

    #[test]
    fn test_backprop_with_reuse() {
        let a = Rc::new(
            TensorBuilder::new(array![2.0].into_dyn())
                .identifier("reused_a")
                .requires_gradient(true)
                .build(),
        );
        let b = Rc::new(
            TensorBuilder::new(array![3.0].into_dyn())
                .identifier("reused_b")
                .requires_gradient(true)
                .build(),
        );

        // Compute (a * b) + (a + b)
        let mul = Multiplication {}.forward(vec![a.clone(), b.clone()]);
        let add = Addition {}.forward(vec![a.clone(), b.clone()]);
        let result = Addition {}.forward(vec![mul, add]);

        backprop(result).unwrap();

        // d/da = b + 1, d/db = a + 1
        assert_eq!(a.gradient().unwrap(), array![4.0].into_dyn());
        assert_eq!(b.gradient().unwrap(), array![3.0].into_dyn());
    }

    #[test]
    fn test_untracked_parent_receives_no_gradient() {
        let x = Rc::new(
            TensorBuilder::new(array![2.0].into_dyn())
                .requires_gradient(true)
                .build(),
        );
        let constant = Rc::new(TensorBuilder::new(array![5.0].into_dyn()).build());
        let product = x.mul(&constant);
        backprop(product).unwrap();
        assert_eq!(x.gradient().unwrap(), array![5.0].into_dyn());
        assert!(constant.gradient().is_none());
    }

    #[test]
    fn test_shared_identifier_does_not_merge_tensors() {
        let a = Rc::new(
            TensorBuilder::new(array![2.0].into_dyn())
                .identifier("twin")
                .requires_gradient(true)
                .build(),
        );
        let b = Rc::new(
            TensorBuilder::new(array![3.0].into_dyn())
                .identifier("twin")
                .requires_gradient(true)
                .build(),
        );
        assert_ne!(*a, *b);
        backprop(a.mul(&b)).unwrap();
        assert_eq!(a.gradient().unwrap(), array![3.0].into_dyn());
        assert_eq!(b.gradient().unwrap(), array![2.0].into_dyn());
    }

    #[test]
    fn test_operation_on_untracked_inputs_is_a_leaf() {
        let a = Rc::new(TensorBuilder::new(array![1.0].into_dyn()).build());
        let b = Rc::new(TensorBuilder::new(array![2.0].into_dyn()).build());
        let sum = a.add(&b);
        assert!(sum.is_leaf());
        assert!(!sum.requires_gradient());
        assert!(sum.gradient_function().is_none());
    }

    #[test]
    fn test_no_gradient_scope() {
        let x = Rc::new(TensorBuilder::ones(&[3]).requires_gradient(true).build());
        assert!(x.pow(2.).requires_gradient());
        {
            let _guard = no_gradient();
            assert!(!is_gradient_enabled());
            let squared = x.pow(2.);
            assert!(!squared.requires_gradient());
            assert!(squared.is_leaf());
        }
        assert!(is_gradient_enabled());
        assert!(x.pow(2.).requires_gradient());
    }

    #[test]
    fn test_no_gradient_guards_nest() {
        let outer = no_gradient();
        {
            let _inner = no_gradient();
            assert!(!is_gradient_enabled());
        }
        // dropping the inner guard restores the outer scope, not tracking
        assert!(!is_gradient_enabled());
        drop(outer);
        assert!(is_gradient_enabled());
    }

    #[test]
    fn test_backprop_on_untracked_tensor_fails() {
        let x = Rc::new(TensorBuilder::ones(&[2]).requires_gradient(true).build());
        let y = {
            let _guard = no_gradient();
            x.scale(2.).sum()
        };
        assert!(matches!(backprop(y), Err(Error::NotTracked)));
        assert!(x.gradient().is_none());
    }

    #[test]
    fn test_implicit_gradient_needs_single_element() {
        let x = Rc::new(TensorBuilder::ones(&[3]).requires_gradient(true).build());
        let y = x.scale(2.);
        match backprop(y) {
            Err(Error::ImplicitGradientForNonScalar { shape }) => assert_eq!(shape, vec![3]),
            other => panic!("expected non-scalar error, got {:?}", other),
        }
    }

    #[test]
    fn test_explicit_gradient_shape_must_match() {
        let x = Rc::new(TensorBuilder::ones(&[3]).requires_gradient(true).build());
        let y = x.scale(2.);
        let result = backprop_with_gradient(y, array![1.0, 1.0].into_dyn());
        assert!(matches!(result, Err(Error::GradientShapeMismatch { .. })));
    }

    #[test]
    fn test_gradients_accumulate_until_zeroed() {
        let x = Rc::new(
            TensorBuilder::new(array![1.0, 2.0].into_dyn())
                .requires_gradient(true)
                .build(),
        );
        backprop(x.scale(3.).sum()).unwrap();
        backprop(x.scale(3.).sum()).unwrap();
        assert_eq!(x.gradient().unwrap(), array![6.0, 6.0].into_dyn());
        x.zero_gradient();
        assert!(x.gradient().is_none());
    }

    #[test]
    fn test_backprop_from_tracked_leaf() {
        let x = Rc::new(
            TensorBuilder::new(array![7.0].into_dyn())
                .requires_gradient(true)
                .build(),
        );
        backprop(x.clone()).unwrap();
        assert_eq!(x.gradient().unwrap(), array![1.0].into_dyn());
    }

    #[test]
    fn test_detach_leaves_graph() {
        let x = Rc::new(TensorBuilder::ones(&[2]).requires_gradient(true).build());
        let y = x.scale(2.);
        let detached = y.detach();
        assert!(detached.is_leaf());
        assert!(!detached.requires_gradient());
        assert_eq!(detached.array(), y.array());
    }

    #[test]
    fn test_from_vec_checks_length() {
        assert!(TensorBuilder::from_vec(&[3], vec![0.1, 1.0, 0.0001]).is_ok());
        assert!(matches!(
            TensorBuilder::from_vec(&[2, 2], vec![1.0]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_norm() {
        let x = TensorBuilder::new(array![3.0, 4.0].into_dyn()).build();
        assert_eq!(x.norm(), 5.0);
    }

    #[test]
    fn test_display_names_gradient_function() {
        let x = Rc::new(TensorBuilder::ones(&[1]).requires_gradient(true).build());
        let y = x.add_scalar(2.);
        assert!(format!("{}", y).contains("grad_fn=<AddScalarBackward>"));
        assert!(format!("{}", x).contains("requires_gradient=true"));
    }
}
