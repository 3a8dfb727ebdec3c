use std::rc::Rc;

use log::debug;
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand_distr::Uniform;

use super::operations::{Operation, Reshape};
use super::{derive, Error, Parameterized, Tensor, TensorBuilder};

#[derive(Clone, Debug, PartialEq)]
pub struct Conv1dConfiguration {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub bias: bool,
}

impl Default for Conv1dConfiguration {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: 1,
            stride: 1,
            padding: 0,
            dilation: 1,
            bias: true,
        }
    }
}

impl Conv1dConfiguration {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            ..Self::default()
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (name, value) in [
            ("in_channels", self.in_channels),
            ("out_channels", self.out_channels),
            ("kernel_size", self.kernel_size),
            ("stride", self.stride),
            ("dilation", self.dilation),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfiguration(format!(
                    "{} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Span of input positions one output position sees.
    pub fn receptive_field(&self) -> usize {
        self.dilation * (self.kernel_size - 1) + 1
    }

    /// ⌊(L + 2p − d·(k − 1) − 1) / s⌋ + 1, or `None` if the kernel doesn't
    /// fit the padded input at all.
    pub fn output_length(&self, input_length: usize) -> Option<usize> {
        let padded_length = input_length + 2 * self.padding;
        let receptive_field = self.receptive_field();
        if padded_length < receptive_field {
            return None;
        }
        Some((padded_length - receptive_field) / self.stride + 1)
    }
}

/// Position in the unpadded input that kernel tap `k` of output position `t`
/// reads, if it doesn't land in the zero padding.
fn input_position(
    t: usize,
    k: usize,
    stride: usize,
    dilation: usize,
    padding: usize,
    length: usize,
) -> Option<usize> {
    let padded = t * stride + k * dilation;
    if padded < padding {
        return None;
    }
    let position = padded - padding;
    if position < length {
        Some(position)
    } else {
        None
    }
}

/// Cross-correlation over a batch of shape `(batch, in_channels, length)`
/// with weights `(out_channels, in_channels, kernel_size)` and an optional
/// bias `(out_channels)`, as parents `[input, weight]` or `[input, weight,
/// bias]`.
pub struct Convolution1d {
    stride: usize,
    padding: usize,
    dilation: usize,
}

impl Convolution1d {
    pub fn new(stride: usize, padding: usize, dilation: usize) -> Self {
        Self {
            stride,
            padding,
            dilation,
        }
    }

    fn output_length(&self, length: usize, kernel_size: usize) -> usize {
        let padded_length = length + 2 * self.padding;
        let receptive_field = self.dilation * (kernel_size - 1) + 1;
        assert!(
            padded_length >= receptive_field,
            "kernel must fit the padded input"
        );
        (padded_length - receptive_field) / self.stride + 1
    }
}

fn three_dimensional(tensor: &Tensor) -> Array3<f32> {
    tensor
        .array
        .clone()
        .into_dimensionality::<Ix3>()
        .expect("three-dimensional")
}

impl Operation for Convolution1d {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Rc<Tensor> {
        assert!(
            inputs.len() == 2 || inputs.len() == 3,
            "input, weight, and optional bias expected"
        );
        let x = three_dimensional(&inputs[0]);
        let w = three_dimensional(&inputs[1]);
        let (batch_size, in_channels, length) = x.dim();
        let (out_channels, weight_in_channels, kernel_size) = w.dim();
        assert_eq!(in_channels, weight_in_channels, "channel counts must agree");
        let out_length = self.output_length(length, kernel_size);

        let mut output = Array3::<f32>::zeros((batch_size, out_channels, out_length));
        if let Some(bias) = inputs.get(2) {
            for (o, &b) in bias.array.iter().enumerate() {
                output.slice_mut(s![.., o, ..]).fill(b);
            }
        }
        for n in 0..batch_size {
            for o in 0..out_channels {
                for t in 0..out_length {
                    let mut accumulator = 0.;
                    for c in 0..in_channels {
                        for k in 0..kernel_size {
                            if let Some(i) = input_position(
                                t,
                                k,
                                self.stride,
                                self.dilation,
                                self.padding,
                                length,
                            ) {
                                accumulator += w[[o, c, k]] * x[[n, c, i]];
                            }
                        }
                    }
                    output[[n, o, t]] += accumulator;
                }
            }
        }

        derive(
            output.into_dyn(),
            Box::new(Convolution1d::new(self.stride, self.padding, self.dilation)),
            inputs,
        )
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: Vec<Rc<Tensor>>,
        arg_index: usize,
    ) -> ArrayD<f32> {
        let out_gradient = out_gradient
            .clone()
            .into_dimensionality::<Ix3>()
            .expect("out gradient is three-dimensional");
        let (batch_size, out_channels, out_length) = out_gradient.dim();
        match arg_index {
            0 => {
                // dL/dx[n, c, i] = Σ dL/dy[n, o, t] · w[o, c, k] over taps reading i
                let x = three_dimensional(&args[0]);
                let w = three_dimensional(&args[1]);
                let (_, in_channels, length) = x.dim();
                let kernel_size = w.dim().2;
                let mut gradient = Array3::<f32>::zeros(x.raw_dim());
                for n in 0..batch_size {
                    for o in 0..out_channels {
                        for t in 0..out_length {
                            let upstream = out_gradient[[n, o, t]];
                            for c in 0..in_channels {
                                for k in 0..kernel_size {
                                    if let Some(i) = input_position(
                                        t,
                                        k,
                                        self.stride,
                                        self.dilation,
                                        self.padding,
                                        length,
                                    ) {
                                        gradient[[n, c, i]] += upstream * w[[o, c, k]];
                                    }
                                }
                            }
                        }
                    }
                }
                gradient.into_dyn()
            }
            1 => {
                // dL/dw[o, c, k] = Σ dL/dy[n, o, t] · x[n, c, i]
                let x = three_dimensional(&args[0]);
                let w = three_dimensional(&args[1]);
                let (_, in_channels, length) = x.dim();
                let kernel_size = w.dim().2;
                let mut gradient = Array3::<f32>::zeros(w.raw_dim());
                for n in 0..batch_size {
                    for o in 0..out_channels {
                        for t in 0..out_length {
                            let upstream = out_gradient[[n, o, t]];
                            for c in 0..in_channels {
                                for k in 0..kernel_size {
                                    if let Some(i) = input_position(
                                        t,
                                        k,
                                        self.stride,
                                        self.dilation,
                                        self.padding,
                                        length,
                                    ) {
                                        gradient[[o, c, k]] += upstream * x[[n, c, i]];
                                    }
                                }
                            }
                        }
                    }
                }
                gradient.into_dyn()
            }
            // the bias sees every batch element and position
            2 => out_gradient.sum_axis(Axis(2)).sum_axis(Axis(0)).into_dyn(),
            _ => panic!("convolution has at most three arguments"),
        }
    }

    fn name(&self) -> &'static str {
        "ConvolutionBackward"
    }
}

pub struct Conv1d {
    identifier: String,
    configuration: Conv1dConfiguration,
    weight: Rc<Tensor>,
    bias: Option<Rc<Tensor>>,
}

impl Conv1d {
    pub fn from_weights(
        identifier: &str,
        configuration: Conv1dConfiguration,
        weight: ArrayD<f32>,
        bias: Option<ArrayD<f32>>,
    ) -> Result<Conv1d, Error> {
        configuration.validate()?;
        let expected_weight_shape = [
            configuration.out_channels,
            configuration.in_channels,
            configuration.kernel_size,
        ];
        if weight.shape() != expected_weight_shape {
            return Err(Error::ShapeMismatch {
                operation: "Conv1d weight",
                expected: format!("{:?}", expected_weight_shape),
                actual: weight.shape().to_vec(),
            });
        }
        if let Some(bias) = &bias {
            if bias.shape() != [configuration.out_channels] {
                return Err(Error::ShapeMismatch {
                    operation: "Conv1d bias",
                    expected: format!("[{}]", configuration.out_channels),
                    actual: bias.shape().to_vec(),
                });
            }
        }
        if bias.is_some() != configuration.bias {
            return Err(Error::InvalidConfiguration(
                "bias presence must agree with the configuration".to_owned(),
            ));
        }
        Ok(Conv1d {
            identifier: identifier.to_owned(),
            weight: Rc::new(
                TensorBuilder::new(weight)
                    .requires_gradient(true)
                    .identifier(&format!("{}_weight", identifier))
                    .build(),
            ),
            bias: bias.map(|bias| {
                Rc::new(
                    TensorBuilder::new(bias)
                        .requires_gradient(true)
                        .identifier(&format!("{}_bias", identifier))
                        .build(),
                )
            }),
            configuration,
        })
    }

    /// Weights and bias drawn uniformly from ±1/√(in_channels · kernel_size).
    pub fn new(identifier: &str, configuration: Conv1dConfiguration) -> Result<Conv1d, Error> {
        configuration.validate()?;
        let k = 1. / ((configuration.in_channels * configuration.kernel_size) as f32);
        let distribution = Uniform::new(-k.sqrt(), k.sqrt());
        let weight = Array::random(
            (
                configuration.out_channels,
                configuration.in_channels,
                configuration.kernel_size,
            ),
            distribution,
        )
        .into_dyn();
        let bias = if configuration.bias {
            Some(Array::random((configuration.out_channels,), distribution).into_dyn())
        } else {
            None
        };
        debug!(
            "creating Conv1d layer {} with weight shape {:?}",
            identifier,
            weight.shape()
        );
        Self::from_weights(identifier, configuration, weight, bias)
    }

    pub fn configuration(&self) -> &Conv1dConfiguration {
        &self.configuration
    }

    pub fn weight(&self) -> Rc<Tensor> {
        self.weight.clone()
    }

    pub fn bias(&self) -> Option<Rc<Tensor>> {
        self.bias.clone()
    }

    /// Accepts `(batch, in_channels, length)` or unbatched `(in_channels,
    /// length)`; the output keeps the same batching.
    pub fn forward(&self, input: Rc<Tensor>) -> Result<Rc<Tensor>, Error> {
        let shape = input.shape().to_vec();
        let unbatched = match shape.len() {
            2 => true,
            3 => false,
            _ => {
                return Err(Error::ShapeMismatch {
                    operation: "Conv1d",
                    expected: "(batch, channels, length) or (channels, length)".to_owned(),
                    actual: shape,
                })
            }
        };
        let channels = shape[shape.len() - 2];
        let length = shape[shape.len() - 1];
        if channels != self.configuration.in_channels {
            return Err(Error::ShapeMismatch {
                operation: "Conv1d",
                expected: format!("{} input channels", self.configuration.in_channels),
                actual: shape,
            });
        }
        if self.configuration.output_length(length).is_none() {
            return Err(Error::InputTooShort {
                padded_length: length + 2 * self.configuration.padding,
                receptive_field: self.configuration.receptive_field(),
            });
        }

        let batched = if unbatched {
            Reshape::new(vec![1, channels, length]).forward(vec![input])
        } else {
            input
        };
        let mut arguments = vec![batched, self.weight.clone()];
        if let Some(bias) = &self.bias {
            arguments.push(bias.clone());
        }
        let output = Convolution1d::new(
            self.configuration.stride,
            self.configuration.padding,
            self.configuration.dilation,
        )
        .forward(arguments);

        if unbatched {
            let output_shape = output.shape()[1..].to_vec();
            Ok(Reshape::new(output_shape).forward(vec![output]))
        } else {
            Ok(output)
        }
    }
}

impl Parameterized for Conv1d {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn parameters(&self) -> Vec<Rc<Tensor>> {
        let mut parameters = vec![self.weight.clone()];
        parameters.extend(self.bias.clone());
        parameters
    }
}
