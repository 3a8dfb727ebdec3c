use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use log::{info, warn};

use crate::core::convolution::{Conv1d, Conv1dConfiguration};
use crate::core::graph::render_dot;
use crate::core::operations::TensorOperations;
use crate::core::{
    backprop, backprop_with_gradient, no_gradient, Error, Parameterized, Tensor, TensorBuilder,
};

// f32 runs out of exponent long before this; only an all-zero start gets here
const MAXIMUM_DOUBLINGS: usize = 256;

pub struct WalkthroughConfiguration {
    pub batch_size: usize,
    pub sequence_length: usize,
    pub convolution: Conv1dConfiguration,
    pub norm_ceiling: f32,
    pub upstream_gradient: Vec<f32>,
    pub graph_output: Option<PathBuf>,
}

impl Default for WalkthroughConfiguration {
    fn default() -> Self {
        Self {
            batch_size: 20,
            sequence_length: 50,
            convolution: Conv1dConfiguration::new(16, 33, 3).stride(2),
            norm_ceiling: 1000.,
            upstream_gradient: vec![0.1, 1.0, 0.0001],
            graph_output: None,
        }
    }
}

/// The tensors of the small arithmetic chain, kept around for the graph cell.
pub struct ArithmeticChain {
    pub x: Rc<Tensor>,
    pub y: Rc<Tensor>,
    pub z: Rc<Tensor>,
    pub out: Rc<Tensor>,
}

pub struct NormLoopOutcome {
    pub x: Rc<Tensor>,
    pub y: Rc<Tensor>,
    pub factor: f32,
}

fn section(title: &str) {
    println!();
    println!("── {} ──", title);
}

pub fn convolution_cell(configuration: &WalkthroughConfiguration) -> Result<Vec<usize>, Error> {
    section("one-dimensional convolution");
    let layer = Conv1d::new("conv", configuration.convolution.clone())?;
    let layer_configuration = layer.configuration();
    println!(
        "{}: Conv1d({}, {}, kernel_size={}, stride={})",
        layer.identifier(),
        layer_configuration.in_channels,
        layer_configuration.out_channels,
        layer_configuration.kernel_size,
        layer_configuration.stride
    );
    println!("weight shape: {:?}", layer.weight().shape());
    if let Some(bias) = layer.bias() {
        println!("bias shape: {:?}", bias.shape());
    }
    println!("parameter count: {}", layer.parameter_count());

    let input = Rc::new(
        TensorBuilder::randn(&[
            configuration.batch_size,
            layer_configuration.in_channels,
            configuration.sequence_length,
        ])
        .identifier("conv_input")
        .build(),
    );
    println!("input shape: {:?}", input.shape());
    let output = layer.forward(input.clone())?;
    println!("output shape: {:?}", output.shape());

    let unstrided = Conv1d::new(
        "conv_unstrided",
        layer_configuration
            .clone()
            .stride(1)
            .padding(0)
            .dilation(1)
            .bias(false),
    )?;
    println!(
        "{} has no bias, so {} parameters",
        unstrided.identifier(),
        unstrided.parameter_count()
    );
    let unstrided_output = unstrided.forward(input)?;
    println!(
        "with stride 1 and no padding, a kernel of size {} turns {} positions into {}",
        layer_configuration.kernel_size,
        configuration.sequence_length,
        unstrided_output.shape()[2]
    );
    Ok(output.shape().to_vec())
}

pub fn gradient_cell() -> Result<ArithmeticChain, Error> {
    section("gradients through a chain of arithmetic");
    let x = Rc::new(
        TensorBuilder::ones(&[2, 2])
            .identifier("x")
            .requires_gradient(true)
            .build(),
    );
    println!("x = {}", x);

    let y = x.add_scalar(2.);
    println!("y = x + 2 = {}", y);
    println!("y was produced by {:?}", y.gradient_function());
    println!("x + x is produced by {:?}", x.add(&x).gradient_function());

    let z = y.mul(&y).scale(3.);
    let out = z.mean();
    println!("z = y * y * 3 = {}", z);
    println!("out = mean(z) = {}", out);
    println!("out.item() = {}", out.item());

    backprop(out.clone())?;
    if let Some(gradient) = x.gradient() {
        // d(out)/dx = 3/4 · 2(x + 2) = 4.5 at x = 1
        println!("d(out)/dx =\n{}", gradient);
    }
    Ok(ArithmeticChain { x, y, z, out })
}

pub fn graph_cell(
    chain: &ArithmeticChain,
    configuration: &WalkthroughConfiguration,
) -> Result<String, Error> {
    section("the computation graph");
    let mut names = HashMap::new();
    names.insert(chain.x.identifier().to_owned(), "x".to_owned());
    let dot = render_dot(&chain.out, &names);
    match &configuration.graph_output {
        Some(path) => {
            fs::write(path, &dot)?;
            info!("wrote computation graph to {:?}", path);
            println!("render it with `dot -Tpng {} -o graph.png`", path.display());
        }
        None => println!("{}", dot),
    }
    Ok(dot)
}

/// Doubles `x` until the result's norm reaches `ceiling`, returning the
/// result and the overall factor applied.
pub fn double_until_norm(x: &Rc<Tensor>, ceiling: f32) -> (Rc<Tensor>, f32) {
    let mut y = x.scale(2.);
    let mut factor = 2.;
    let mut doublings = 0;
    while y.norm() < ceiling && doublings < MAXIMUM_DOUBLINGS {
        y = y.scale(2.);
        factor *= 2.;
        doublings += 1;
    }
    if doublings == MAXIMUM_DOUBLINGS {
        warn!("gave up doubling after {} rounds", doublings);
    }
    (y, factor)
}

pub fn norm_loop_cell(configuration: &WalkthroughConfiguration) -> Result<NormLoopOutcome, Error> {
    section("a loop bounded by a norm");
    let x = Rc::new(
        TensorBuilder::randn(&[configuration.upstream_gradient.len()])
            .identifier("x_random")
            .requires_gradient(true)
            .build(),
    );
    let (y, factor) = double_until_norm(&x, configuration.norm_ceiling);
    println!("y = {}", y);
    println!("‖y‖ = {} after scaling x by {}", y.norm(), factor);

    // y isn't a single element, so backprop needs the upstream gradient spelled out
    let upstream = TensorBuilder::from_vec(
        &[configuration.upstream_gradient.len()],
        configuration.upstream_gradient.clone(),
    )?
    .build();
    println!("upstream gradient v = {}", upstream);
    backprop_with_gradient(y.clone(), upstream.array().clone())?;
    if let Some(gradient) = x.gradient() {
        println!("x gradient = {}", gradient);
    }
    Ok(NormLoopOutcome { x, y, factor })
}

/// Shows that tracking can be switched off, and what asking for gradients of
/// an untracked result does. Returns the caught error.
pub fn no_gradient_cell() -> Option<Error> {
    section("switching gradient tracking off");
    let x = Rc::new(
        TensorBuilder::randn(&[3])
            .identifier("x_untracked_demo")
            .requires_gradient(true)
            .build(),
    );
    println!("x.requires_gradient: {}", x.requires_gradient());
    println!("(x ** 2).requires_gradient: {}", x.pow(2.).requires_gradient());
    println!(
        "x.detach().requires_gradient: {}",
        x.detach().requires_gradient()
    );

    let untracked = {
        let _guard = no_gradient();
        let squared = x.pow(2.);
        println!(
            "inside no_gradient(), (x ** 2).requires_gradient: {}",
            squared.requires_gradient()
        );
        squared.sum()
    };

    match backprop(untracked) {
        Ok(()) => {
            warn!("backprop through an untracked tensor succeeded");
            None
        }
        Err(error) => {
            println!("caught error: {}", error);
            Some(error)
        }
    }
}

pub fn run_all(configuration: &WalkthroughConfiguration) -> Result<(), Error> {
    info!("running every cell");
    convolution_cell(configuration)?;
    let chain = gradient_cell()?;
    graph_cell(&chain, configuration)?;
    norm_loop_cell(configuration)?;
    no_gradient_cell();
    Ok(())
}
