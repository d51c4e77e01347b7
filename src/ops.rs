//! Local gradient rules for every operation that can appear in a computation graph
//!
//! During backprop each derived node hands its accumulated gradient to its operands
//! according to the rule of the operation which created it.

use crate::value::Value;

/// The operation which produced a derived value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Pow,
    ReLU,
    Exp,
    Ln,
    /// n-ary sum, used for dot products and reductions
    Sum,
}

impl Op {
    /// Number of operands the operation takes, `None` for variadic operations
    pub fn arity(&self) -> Option<usize> {
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow => Some(2),
            Op::Neg | Op::ReLU | Op::Exp | Op::Ln => Some(1),
            Op::Sum => None,
        }
    }

    /// Name shown when printing a graph, mirrors PyTorch's `grad_fn` naming
    pub fn grad_fn_name(&self) -> &'static str {
        match self {
            Op::Add => "AddBackward",
            Op::Sub => "SubBackward",
            Op::Mul => "MulBackward",
            Op::Div => "DivBackward",
            Op::Neg => "NegBackward",
            Op::Pow => "PowBackward",
            Op::ReLU => "ReluBackward",
            Op::Exp => "ExpBackward",
            Op::Ln => "LogBackward",
            Op::Sum => "SumBackward",
        }
    }

    /// Accumulates `out`'s gradient into `inputs` according to this operation
    pub(crate) fn backward(&self, inputs: &[Value], out: &Value) {
        if let Some(n) = self.arity() {
            debug_assert_eq!(n, inputs.len(), "{:?} expects {} operands", self, n);
        }
        let grad = out.grad();
        match self {
            Op::Add => {
                inputs[0].add_grad(grad);
                inputs[1].add_grad(grad);
            }
            Op::Sub => {
                inputs[0].add_grad(grad);
                inputs[1].add_grad(-grad);
            }
            Op::Mul => {
                let (a, b) = (inputs[0].data(), inputs[1].data());
                inputs[0].add_grad(b * grad);
                inputs[1].add_grad(a * grad);
            }
            Op::Div => {
                let (a, b) = (inputs[0].data(), inputs[1].data());
                inputs[0].add_grad(grad / b);
                inputs[1].add_grad(-a * grad / (b * b));
            }
            Op::Neg => inputs[0].add_grad(-grad),
            Op::Pow => {
                // d(a^b)/db needs ln(a), undefined for a <= 0, so exponents are treated as constants
                let (a, b) = (inputs[0].data(), inputs[1].data());
                inputs[0].add_grad(b * a.powf(b - 1.0) * grad);
            }
            Op::ReLU => {
                let local = if inputs[0].data() > 0.0 { 1.0 } else { 0.0 };
                inputs[0].add_grad(local * grad);
            }
            Op::Exp => inputs[0].add_grad(out.data() * grad),
            Op::Ln => {
                let a = inputs[0].data();
                inputs[0].add_grad(grad / a);
            }
            Op::Sum => {
                for input in inputs {
                    input.add_grad(grad);
                }
            }
        }
    }
}
