//! Components to build a neural network

use std::{
    fmt::{self, Display},
    sync::atomic::{self, AtomicUsize},
};

use clap::ValueEnum;
use rand::Rng;
use rand_distr::{Distribution, Normal, NormalError};
use thiserror::Error;

use crate::value::Value;

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected}, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("A layer needs at least one input and one output, got {n_inputs} -> {n_outputs}")]
    EmptyLayer { n_inputs: usize, n_outputs: usize },
    #[error("Invalid weight initialisation: {0}")]
    Init(#[from] NormalError),
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    fn parameters(&self) -> Vec<Value>;
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError>;
    /// One line summary, e.g. `Linear(in_features=784, out_features=128)`
    fn describe(&self) -> String;
}

/// A single neuron in a layer of a NN
pub struct Neuron {
    /// weights of the neuron
    pub weights: Vec<Value>,
    /// bias of the neuron
    pub bias: Value,
}

impl Neuron {
    fn new<R: Rng + ?Sized>(normal: &Normal<f32>, n_inputs: usize, rng: &mut R) -> Self {
        let weights = (0..n_inputs)
            .map(|_| Value::new(normal.sample(rng)))
            .collect();
        Self {
            weights,
            bias: Value::new(normal.sample(rng)),
        }
    }

    // Testing utility for a deterministic and simple neuron
    #[cfg(test)]
    fn new_ones(n_inputs: usize) -> Self {
        Self {
            weights: (0..n_inputs).map(|_| Value::new(1.0)).collect(),
            bias: Value::new(1.0),
        }
    }

    pub fn parameters(&self) -> Vec<Value> {
        self.weights
            .iter()
            .chain(std::iter::once(&self.bias))
            .cloned()
            .collect()
    }

    /// `w . x + b` as a single sum node
    pub fn forward(&self, inputs: &[Value]) -> Result<Value, NNError> {
        if inputs.len() != self.weights.len() {
            return Err(NNError::InputSizeMismatch {
                expected: self.weights.len(),
                got: inputs.len(),
            });
        }
        let terms = self
            .weights
            .iter()
            .zip(inputs.iter())
            .map(|(w, i)| w * i)
            .chain(std::iter::once(self.bias.clone()))
            .collect::<Vec<_>>();
        Ok(Value::sum(&terms))
    }
}

/// Fully connected layer, the equivalent of torch.nn.Linear
pub struct Linear {
    n_inputs: usize,
    neurons: Vec<Neuron>,
    n_output_nans: AtomicUsize,
    n_parameters_nans: AtomicUsize,
}

impl Linear {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new<R: Rng + ?Sized>(
        n_inputs: usize,
        n_outputs: usize,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        if n_inputs == 0 || n_outputs == 0 {
            return Err(NNError::EmptyLayer {
                n_inputs,
                n_outputs,
            });
        }
        // He initialization keeps the variance of the output close to the input's so
        // activations neither explode nor vanish through the ReLU stack
        let std = (2.0 / n_inputs as f32).sqrt();
        let normal = Normal::new(0.0, std)?;
        let neurons = (0..n_outputs)
            .map(|_| Neuron::new(&normal, n_inputs, rng))
            .collect();
        Ok(Self::from_neurons(n_inputs, neurons))
    }

    fn from_neurons(n_inputs: usize, neurons: Vec<Neuron>) -> Self {
        Self {
            n_inputs,
            neurons,
            n_output_nans: AtomicUsize::new(0),
            n_parameters_nans: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    fn new_ones(n_inputs: usize, n_outputs: usize) -> Self {
        let neurons = (0..n_outputs).map(|_| Neuron::new_ones(n_inputs)).collect();
        Self::from_neurons(n_inputs, neurons)
    }

    pub fn in_features(&self) -> usize {
        self.n_inputs
    }

    pub fn out_features(&self) -> usize {
        self.neurons.len()
    }

    /// Number of NaN outputs seen in the last forward pass (used for debugging)
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }

    /// Number of NaN weights and biases at the last forward pass
    pub fn n_parameters_nans(&self) -> usize {
        self.n_parameters_nans.load(atomic::Ordering::Relaxed)
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<Value> {
        self.neurons.iter().flat_map(|n| n.parameters()).collect()
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let outputs = self
            .neurons
            .iter()
            .map(|n| n.forward(inputs))
            .collect::<Result<Vec<_>, _>>()?;
        let n_output_nans = outputs.iter().filter(|v| v.data().is_nan()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        let n_parameters_nans = self
            .parameters()
            .iter()
            .filter(|v| v.data().is_nan())
            .count();
        self.n_parameters_nans
            .store(n_parameters_nans, atomic::Ordering::Relaxed);
        log::debug!(
            "{}: n_output_nans: {}, n_parameters_nans: {}",
            self.describe(),
            n_output_nans,
            n_parameters_nans
        );
        Ok(outputs)
    }

    fn describe(&self) -> String {
        format!(
            "Linear(in_features={}, out_features={})",
            self.in_features(),
            self.out_features()
        )
    }
}

/// Applies ReLU to a set of values, works for arbitrary number of inputs
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of dead neurons in the last forward pass (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

impl Module for ReLU {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    /// Takes the element-wise ReLU of the input values
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let n_dead_neurons = inputs.iter().filter(|v| v.data() <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        Ok(inputs.iter().map(|v| v.relu()).collect())
    }

    fn describe(&self) -> String {
        "ReLU()".to_string()
    }
}

/// Subtracts the largest input as a constant. Softmax and log-softmax are invariant to
/// the shift, and it keeps `exp` from overflowing to `inf`.
fn shift_by_max(inputs: &[Value]) -> Vec<Value> {
    let max = inputs
        .iter()
        .map(|v| v.data())
        .fold(f32::NEG_INFINITY, f32::max);
    let max = Value::new(max);
    inputs.iter().map(|v| v - &max).collect()
}

/// Applies softmax to a set of values
#[derive(Default)]
pub struct Softmax {}

impl Softmax {
    pub fn new() -> Self {
        Self {}
    }
}

impl Module for Softmax {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let exps = shift_by_max(inputs)
            .iter()
            .map(|v| v.exp())
            .collect::<Vec<_>>();
        let exp_sum = Value::sum(&exps);
        Ok(exps.iter().map(|e| e / &exp_sum).collect())
    }

    fn describe(&self) -> String {
        "Softmax(dim=1)".to_string()
    }
}

/// Log of the softmax, `x_i - log(sum_j exp(x_j))`, paired with [`crate::loss::NLLLoss`]
#[derive(Default)]
pub struct LogSoftmax {}

impl LogSoftmax {
    pub fn new() -> Self {
        Self {}
    }
}

impl Module for LogSoftmax {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let shifted = shift_by_max(inputs);
        let exps = shifted.iter().map(|v| v.exp()).collect::<Vec<_>>();
        let log_sum_exp = Value::sum(&exps).ln();
        Ok(shifted.iter().map(|v| v - &log_sum_exp).collect())
    }

    fn describe(&self) -> String {
        "LogSoftmax(dim=1)".to_string()
    }
}

/// Chains modules, feeding the output of each into the next. Analogous to torch.nn.Sequential
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a module to the end of the chain
    pub fn add(mut self, layer: impl Module + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> impl Iterator<Item = &dyn Module> {
        self.layers.iter().map(|l| l.as_ref())
    }
}

impl Module for Sequential {
    fn parameters(&self) -> Vec<Value> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let mut out = inputs.to_vec();
        for layer in self.layers.iter() {
            out = layer.forward(&out)?;
        }
        Ok(out)
    }

    fn describe(&self) -> String {
        format!("Sequential({} layers)", self.layers.len())
    }
}

impl Display for Sequential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sequential(")?;
        for (i, layer) in self.layers().enumerate() {
            writeln!(f, "  ({}): {}", i, layer.describe())?;
        }
        write!(f, ")")
    }
}

/// What the last layer of a classifier emits
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Head {
    /// Raw scores, to be paired with cross entropy
    Logits,
    /// Log-probabilities, to be paired with negative log likelihood
    LogSoftmax,
}

impl Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Head::Logits => write!(f, "logits"),
            Head::LogSoftmax => write!(f, "log-softmax"),
        }
    }
}

/// Builds a multi-layer perceptron `Linear -> ReLU -> ... -> Linear`, optionally
/// finished by a `LogSoftmax`
pub fn mlp<R: Rng + ?Sized>(
    n_inputs: usize,
    hidden: &[usize],
    n_classes: usize,
    head: Head,
    rng: &mut R,
) -> Result<Sequential, NNError> {
    let mut model = Sequential::new();
    let mut width = n_inputs;
    for &units in hidden {
        model = model.add(Linear::new(width, units, rng)?).add(ReLU::new());
        width = units;
    }
    model = model.add(Linear::new(width, n_classes, rng)?);
    if head == Head::LogSoftmax {
        model = model.add(LogSoftmax::new());
    }
    Ok(model)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::assert_eq_float;

    use super::*;

    fn values(data: &[f32]) -> Vec<Value> {
        data.iter().map(|d| Value::new(*d)).collect()
    }

    #[test]
    fn test_layer_forward() {
        let layer = Linear::new_ones(2, 3);
        let outputs = layer.forward(&values(&[1.0, 2.0])).unwrap();
        assert_eq!(outputs.len(), 3);
        for o in outputs {
            assert_eq!(o.data(), 4.0);
        }
        assert_eq!(layer.parameters().len(), 9);
    }

    #[test]
    fn test_layer_backward_reaches_weights() {
        let layer = Linear::new_ones(2, 1);
        let out = layer.forward(&values(&[3.0, -2.0])).unwrap();
        out[0].backward();
        let grads = layer.parameters().iter().map(|p| p.grad()).collect::<Vec<_>>();
        // d out / d w = x, d out / d b = 1
        assert_eq!(grads, vec![3.0, -2.0, 1.0]);
    }

    #[test]
    fn test_dim_mismatch() {
        let layer = Linear::new_ones(2, 3);
        let err = layer.forward(&values(&[1.0])).unwrap_err();
        assert!(matches!(
            err,
            NNError::InputSizeMismatch {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn test_layer_counts_nans() {
        let layer = Linear::new_ones(2, 3);
        layer.forward(&values(&[1.0, 2.0])).unwrap();
        assert_eq!(layer.n_output_nans(), 0);
        assert_eq!(layer.n_parameters_nans(), 0);

        let mut weight = layer.parameters()[0].clone();
        weight.set_data(f32::NAN);
        layer.forward(&values(&[1.0, 2.0])).unwrap();
        assert_eq!(layer.n_output_nans(), 1);
        assert_eq!(layer.n_parameters_nans(), 1);

        layer.forward(&values(&[f32::NAN, 2.0])).unwrap();
        assert_eq!(layer.n_output_nans(), 3);
    }

    #[test]
    fn test_empty_layer_rejected() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        assert!(matches!(
            Linear::new(0, 3, &mut rng),
            Err(NNError::EmptyLayer { .. })
        ));
    }

    #[test]
    fn test_relu_counts_dead_units() {
        let relu = ReLU::new();
        let out = relu.forward(&values(&[-1.0, 0.0, 2.0])).unwrap();
        assert_eq!(out.iter().map(|v| v.data()).collect::<Vec<_>>(), vec![0.0, 0.0, 2.0]);
        assert_eq!(relu.n_dead_neurons(), 2);
    }

    #[test]
    fn test_softmax() {
        let softmax = Softmax::new();
        let inputs = values(&[1.0, 2.0]);
        let mut outputs = softmax.forward(&inputs).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq_float!(outputs[0].data(), 0.2689414);
        assert_eq_float!(outputs[1].data(), 0.7310585);

        // d s1 / dx1 = s1 * (1 - s1)
        // d s1 / dx2 = -s1 * s2
        outputs[0].backward();
        let s1 = outputs[0].data();
        let s2 = outputs[1].data();
        assert_eq_float!(inputs[0].grad(), s1 * (1.0 - s1));
        assert_eq_float!(inputs[1].grad(), -s1 * s2);

        // zeroing the leaves alone would leave stale gradients on the intermediate nodes
        outputs[0].zero_grad();
        outputs[1].backward();
        assert_eq_float!(inputs[0].grad(), -s1 * s2);
        assert_eq_float!(inputs[1].grad(), s2 * (1.0 - s2));
    }

    #[test]
    fn test_softmax_large_inputs_stay_finite() {
        let outputs = Softmax::new().forward(&values(&[1000.0, 1000.0])).unwrap();
        assert_eq_float!(outputs[0].data(), 0.5);
        assert_eq_float!(outputs[1].data(), 0.5);
    }

    #[test]
    fn test_log_softmax_matches_log_of_softmax() {
        let inputs = values(&[0.5, -1.0, 2.0]);
        let log_probs = LogSoftmax::new().forward(&inputs).unwrap();
        let probs = Softmax::new().forward(&inputs).unwrap();
        for (lp, p) in log_probs.iter().zip(probs.iter()) {
            assert_eq_float!(lp.data(), p.data().ln());
        }
        let total: f32 = log_probs.iter().map(|v| v.data().exp()).sum();
        assert_eq_float!(total, 1.0);
    }

    #[test]
    fn test_mlp_shape_and_display() {
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        let model = mlp(6, &[4, 3], 2, Head::LogSoftmax, &mut rng).unwrap();
        assert_eq!(model.len(), 6);
        // (6*4 + 4) + (4*3 + 3) + (3*2 + 2)
        assert_eq!(model.parameters().len(), 51);

        let out = model.forward(&values(&[0.1; 6])).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|v| v.data() <= 0.0));

        let printed = model.to_string();
        assert!(printed.contains("(0): Linear(in_features=6, out_features=4)"));
        assert!(printed.contains("(1): ReLU()"));
        assert!(printed.contains("(5): LogSoftmax(dim=1)"));
    }

    #[test]
    fn test_mlp_is_seed_deterministic() {
        let a = mlp(3, &[2], 2, Head::Logits, &mut Pcg64Mcg::seed_from_u64(9)).unwrap();
        let b = mlp(3, &[2], 2, Head::Logits, &mut Pcg64Mcg::seed_from_u64(9)).unwrap();
        let pa = a.parameters().iter().map(|p| p.data()).collect::<Vec<_>>();
        let pb = b.parameters().iter().map(|p| p.data()).collect::<Vec<_>>();
        assert_eq!(pa, pb);
    }
}
