use std::rc::Rc;

use ndarray::prelude::*;

use super::{derive, Tensor};

pub trait Operation {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Rc<Tensor>;
    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: Vec<Rc<Tensor>>,
        arg_index: usize,
    ) -> ArrayD<f32>;
    /// Name of the backward node this operation leaves in the graph.
    fn name(&self) -> &'static str;
}

/// Sums a broadcast gradient back down to the shape of the argument it
/// belongs to.
fn reduce_to_shape(gradient: ArrayD<f32>, shape: &[usize]) -> ArrayD<f32> {
    let mut gradient = gradient;
    while gradient.ndim() > shape.len() {
        gradient = gradient.sum_axis(Axis(0));
    }
    for (axis, &length) in shape.iter().enumerate() {
        if length == 1 && gradient.shape()[axis] != 1 {
            gradient = gradient.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    gradient
}

pub struct Addition {}

impl Operation for Addition {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Rc<Tensor> {
        assert!(inputs.len() == 2, "binary operation expected");
        let array = &inputs[0].array + &inputs[1].array;
        derive(array, Box::new(Addition {}), inputs)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: Vec<Rc<Tensor>>,
        arg_index: usize,
    ) -> ArrayD<f32> {
        // Addition just passes the gradient through to both branches.
        reduce_to_shape(out_gradient.clone(), args[arg_index].shape())
    }

    fn name(&self) -> &'static str {
        "AddBackward"
    }
}

pub struct Multiplication {}

impl Operation for Multiplication {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Rc<Tensor> {
        assert!(inputs.len() == 2, "binary operation expected");
        let array = &inputs[0].array * &inputs[1].array;
        derive(array, Box::new(Multiplication {}), inputs)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: Vec<Rc<Tensor>>,
        arg_index: usize,
    ) -> ArrayD<f32> {
        let other_arg_index = match arg_index {
            0 => 1,
            1 => 0,
            _ => panic!("binary operation expected"),
        };
        // d/dx(xy) = y
        let gradient = out_gradient * &args[other_arg_index].array;
        reduce_to_shape(gradient, args[arg_index].shape())
    }

    fn name(&self) -> &'static str {
        "MulBackward"
    }
}

pub struct ScalarAddition {
    constant: f32,
}

impl ScalarAddition {
    pub fn new(constant: f32) -> Self {
        Self { constant }
    }
}

impl Operation for ScalarAddition {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Rc<Tensor> {
        assert!(inputs.len() == 1, "unary operation expected");
        let array = &inputs[0].array + self.constant;
        derive(array, Box::new(ScalarAddition::new(self.constant)), inputs)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        _args: Vec<Rc<Tensor>>,
        _arg_index: usize,
    ) -> ArrayD<f32> {
        out_gradient.clone()
    }

    fn name(&self) -> &'static str {
        "AddScalarBackward"
    }
}

pub struct ScalarMultiplication {
    factor: f32,
}

impl ScalarMultiplication {
    pub fn new(factor: f32) -> Self {
        Self { factor }
    }
}

impl Operation for ScalarMultiplication {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Rc<Tensor> {
        assert!(inputs.len() == 1, "unary operation expected");
        let array = &inputs[0].array * self.factor;
        derive(array, Box::new(ScalarMultiplication::new(self.factor)), inputs)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        _args: Vec<Rc<Tensor>>,
        _arg_index: usize,
    ) -> ArrayD<f32> {
        out_gradient * self.factor
    }

    fn name(&self) -> &'static str {
        "MulScalarBackward"
    }
}

pub struct Power {
    exponent: f32,
}

impl Power {
    pub fn new(exponent: f32) -> Self {
        Self { exponent }
    }
}

impl Operation for Power {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Rc<Tensor> {
        assert!(inputs.len() == 1, "unary operation expected");
        let array = inputs[0].array.mapv(|x| x.powf(self.exponent));
        derive(array, Box::new(Power::new(self.exponent)), inputs)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: Vec<Rc<Tensor>>,
        _arg_index: usize,
    ) -> ArrayD<f32> {
        // d/dx xᵖ = p·xᵖ⁻¹
        let local = args[0]
            .array
            .mapv(|x| self.exponent * x.powf(self.exponent - 1.));
        out_gradient * &local
    }

    fn name(&self) -> &'static str {
        "PowBackward"
    }
}

pub struct Sum {}

impl Operation for Sum {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Rc<Tensor> {
        assert!(inputs.len() == 1, "unary operation expected");
        let array = arr0(inputs[0].array.sum()).into_dyn();
        derive(array, Box::new(Sum {}), inputs)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: Vec<Rc<Tensor>>,
        _arg_index: usize,
    ) -> ArrayD<f32> {
        let upstream = out_gradient.iter().next().copied().unwrap_or(0.);
        Array::from_elem(args[0].array.raw_dim(), upstream)
    }

    fn name(&self) -> &'static str {
        "SumBackward"
    }
}

pub struct Mean {}

impl Operation for Mean {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Rc<Tensor> {
        assert!(inputs.len() == 1, "unary operation expected");
        let count = inputs[0].array.len() as f32;
        let array = arr0(inputs[0].array.sum() / count).into_dyn();
        derive(array, Box::new(Mean {}), inputs)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: Vec<Rc<Tensor>>,
        _arg_index: usize,
    ) -> ArrayD<f32> {
        // every element contributes 1/n of the mean
        let upstream = out_gradient.iter().next().copied().unwrap_or(0.);
        let count = args[0].array.len() as f32;
        Array::from_elem(args[0].array.raw_dim(), upstream / count)
    }

    fn name(&self) -> &'static str {
        "MeanBackward"
    }
}

pub struct Reshape {
    new_shape: Vec<usize>,
}

impl Reshape {
    pub fn new(new_shape: Vec<usize>) -> Self {
        Self { new_shape }
    }
}

impl Operation for Reshape {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Rc<Tensor> {
        assert!(inputs.len() == 1, "unary operation expected");
        let array = inputs[0]
            .array
            .clone()
            .into_shape_with_order(self.new_shape.clone())
            .expect("input must match");
        derive(array, Box::new(Reshape::new(self.new_shape.clone())), inputs)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: Vec<Rc<Tensor>>,
        arg_index: usize,
    ) -> ArrayD<f32> {
        assert!(arg_index == 0);
        out_gradient
            .clone()
            .into_shape_with_order(args[0].shape())
            .expect("input shape should match")
    }

    fn name(&self) -> &'static str {
        "ViewBackward"
    }
}

/// Method-call sugar for building graphs out of shared tensors.
pub trait TensorOperations {
    fn add(&self, other: &Rc<Tensor>) -> Rc<Tensor>;
    fn mul(&self, other: &Rc<Tensor>) -> Rc<Tensor>;
    fn add_scalar(&self, constant: f32) -> Rc<Tensor>;
    fn scale(&self, factor: f32) -> Rc<Tensor>;
    fn pow(&self, exponent: f32) -> Rc<Tensor>;
    fn sum(&self) -> Rc<Tensor>;
    fn mean(&self) -> Rc<Tensor>;
}

impl TensorOperations for Rc<Tensor> {
    fn add(&self, other: &Rc<Tensor>) -> Rc<Tensor> {
        Addition {}.forward(vec![self.clone(), other.clone()])
    }

    fn mul(&self, other: &Rc<Tensor>) -> Rc<Tensor> {
        Multiplication {}.forward(vec![self.clone(), other.clone()])
    }

    fn add_scalar(&self, constant: f32) -> Rc<Tensor> {
        ScalarAddition::new(constant).forward(vec![self.clone()])
    }

    fn scale(&self, factor: f32) -> Rc<Tensor> {
        ScalarMultiplication::new(factor).forward(vec![self.clone()])
    }

    fn pow(&self, exponent: f32) -> Rc<Tensor> {
        Power::new(exponent).forward(vec![self.clone()])
    }

    fn sum(&self) -> Rc<Tensor> {
        Sum {}.forward(vec![self.clone()])
    }

    fn mean(&self) -> Rc<Tensor> {
        Mean {}.forward(vec![self.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{backprop, backprop_with_gradient, TensorBuilder};
    use approx::assert_abs_diff_eq;

    fn tracked(array: ArrayD<f32>) -> Rc<Tensor> {
        Rc::new(TensorBuilder::new(array).requires_gradient(true).build())
    }

    #[test]
    fn test_addition_forward() {
        let a = TensorBuilder::new(array![1.].into_dyn()).build();
        let b = TensorBuilder::new(array![2.].into_dyn()).build();
        let c = Addition {}.forward(vec![Rc::new(a), Rc::new(b)]);
        assert_eq!(*c.array(), array![3.].into_dyn());
    }

    #[test]
    fn test_multiplication_forward() {
        let a = TensorBuilder::new(array![2.].into_dyn()).build();
        let b = TensorBuilder::new(array![3.].into_dyn()).build();
        let c = Multiplication {}.forward(vec![Rc::new(a), Rc::new(b)]);
        assert_eq!(*c.array(), array![6.].into_dyn());
    }

    #[test]
    fn test_addition_backward() {
        let a = TensorBuilder::new(array![1.].into_dyn()).build();
        let b = TensorBuilder::new(array![2.].into_dyn()).build();
        let args = vec![Rc::new(a), Rc::new(b)];
        let out_gradient = array![1.].into_dyn();
        assert_eq!(
            Addition {}.backward(&out_gradient, args.clone(), 0),
            out_gradient
        );
        assert_eq!(
            Addition {}.backward(&out_gradient, args.clone(), 1),
            out_gradient
        );
    }

    #[test]
    fn test_multiplication_backward() {
        let a = TensorBuilder::new(array![2.].into_dyn()).build();
        let b = TensorBuilder::new(array![3.].into_dyn()).build();
        let args = vec![Rc::new(a), Rc::new(b)];
        let out_gradient = array![1.].into_dyn();
        assert_eq!(
            Multiplication {}.backward(&out_gradient, args.clone(), 0),
            array![3.].into_dyn()
        );
        assert_eq!(
            Multiplication {}.backward(&out_gradient, args.clone(), 1),
            array![2.].into_dyn()
        );
    }

    #[test]
    fn test_broadcast_addition_reduces_gradient() {
        let matrix = tracked(array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
        let row = tracked(array![[10., 20., 30.]].into_dyn());
        let result = matrix.add(&row);
        assert_eq!(
            *result.array(),
            array![[11., 22., 33.], [14., 25., 36.]].into_dyn()
        );
        backprop(result.sum()).unwrap();
        assert_eq!(matrix.gradient().unwrap(), Array::<f32, _>::ones((2, 3)).into_dyn());
        assert_eq!(row.gradient().unwrap(), array![[2., 2., 2.]].into_dyn());
    }

    #[test]
    fn test_broadcast_multiplication_reduces_gradient() {
        let vector = tracked(array![1., 2., 3.].into_dyn());
        let matrix = tracked(array![[1., 1., 1.], [2., 2., 2.]].into_dyn());
        backprop(vector.mul(&matrix).sum()).unwrap();
        // each element of the vector meets a column summing to 3
        assert_eq!(vector.gradient().unwrap(), array![3., 3., 3.].into_dyn());
        assert_eq!(
            matrix.gradient().unwrap(),
            array![[1., 2., 3.], [1., 2., 3.]].into_dyn()
        );
    }

    #[test]
    fn test_power() {
        let x = tracked(array![1., 2., 3.].into_dyn());
        let squared = x.pow(2.);
        assert_eq!(*squared.array(), array![1., 4., 9.].into_dyn());
        assert_eq!(squared.gradient_function(), Some("PowBackward"));
        backprop(squared.sum()).unwrap();
        assert_eq!(x.gradient().unwrap(), array![2., 4., 6.].into_dyn());
    }

    #[test]
    fn test_mean_is_zero_dimensional() {
        let x = tracked(array![[1., 2.], [3., 6.]].into_dyn());
        let mean = x.mean();
        assert_eq!(mean.shape(), &[] as &[usize]);
        assert_eq!(mean.item(), 3.);
        backprop(mean).unwrap();
        assert_eq!(x.gradient().unwrap(), Array::from_elem((2, 2), 0.25_f32).into_dyn());
    }

    #[test]
    fn test_scalar_operations() {
        let x = tracked(array![1., -1.].into_dyn());
        let y = x.add_scalar(2.).scale(3.);
        assert_eq!(*y.array(), array![9., 3.].into_dyn());
        assert_eq!(y.gradient_function(), Some("MulScalarBackward"));
        assert_eq!(y.parents()[0].gradient_function(), Some("AddScalarBackward"));
        backprop_with_gradient(y, array![1., 0.5].into_dyn()).unwrap();
        assert_eq!(x.gradient().unwrap(), array![3., 1.5].into_dyn());
    }

    #[test]
    fn test_reshape() {
        let x = tracked(array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
        let flat = Reshape::new(vec![6]).forward(vec![x.clone()]);
        assert_eq!(*flat.array(), array![1., 2., 3., 4., 5., 6.].into_dyn());
        backprop_with_gradient(flat, array![1., 2., 3., 4., 5., 6.].into_dyn()).unwrap();
        assert_eq!(
            x.gradient().unwrap(),
            array![[1., 2., 3.], [4., 5., 6.]].into_dyn()
        );
    }

    #[test]
    fn test_mean_of_squares_matches_reference() {
        // x = torch.ones(2, 2, requires_grad=True)
        // out = ((x + 2) * (x + 2) * 3).mean()
        // out.backward()  # x.grad is 4.5 everywhere
        let x = Rc::new(TensorBuilder::ones(&[2, 2]).requires_gradient(true).build());
        let y = x.add_scalar(2.);
        let z = y.mul(&y).scale(3.);
        let out = z.mean();
        assert_abs_diff_eq!(out.item(), 27.);
        assert_eq!(z.gradient_function(), Some("MulScalarBackward"));
        assert_eq!(out.gradient_function(), Some("MeanBackward"));
        backprop(out).unwrap();
        for &gradient in x.gradient().unwrap().iter() {
            assert_abs_diff_eq!(gradient, 4.5, epsilon = 1e-6);
        }
    }
}
