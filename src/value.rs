//! Scalar values which form a computation graph
use std::{
    cell::RefCell,
    collections::HashSet,
    fmt::{self, Display},
    iter::Sum,
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
};

use crate::ops::Op;

type SharedNode = Rc<RefCell<Node>>;

/// Newtype representing a shared value in a computation graph
///
/// Cloning a `Value` clones the handle, not the node: both clones observe the same
/// data and gradient.
#[derive(Debug, Clone)]
pub struct Value(pub(crate) SharedNode);

impl Value {
    /// Create a new leaf value, not derived from any other values
    pub fn new(data: f32) -> Self {
        Self(Rc::new(RefCell::new(Node {
            data,
            grad: 0.0,
            operands: vec![],
            op: None,
        })))
    }

    /// Create a value derived from `operands` by `op` (i.e. not a leaf node)
    fn derived(data: f32, op: Op, operands: &[&Value]) -> Self {
        Self(Rc::new(RefCell::new(Node {
            data,
            grad: 0.0,
            operands: operands.iter().map(|v| v.0.clone()).collect(),
            op: Some(op),
        })))
    }

    pub fn data(&self) -> f32 {
        self.0.borrow().data
    }

    pub fn grad(&self) -> f32 {
        self.0.borrow().grad
    }

    /// The operation which created this value, `None` for leaves
    pub fn op(&self) -> Option<Op> {
        self.0.borrow().op
    }

    pub fn is_leaf(&self) -> bool {
        self.0.borrow().op.is_none()
    }

    // Strictly, &mut isn't needed since the value is behind a shared mutable type,
    // but it indicates that the value should be exclusively mutable
    pub fn set_data(&mut self, data: f32) {
        self.0.borrow_mut().data = data;
    }

    pub(crate) fn add_grad(&self, delta: f32) {
        self.0.borrow_mut().grad += delta;
    }

    fn operands(&self) -> Vec<Value> {
        self.0.borrow().operands.iter().cloned().map(Value).collect()
    }

    /// Zeros the gradient of this value and of every value it was computed from.
    ///
    /// Unlike PyTorch, which only zeros leaves, intermediate nodes are reset too so a
    /// graph can be backpropagated more than once.
    pub fn zero_grad(&mut self) {
        for value in self.topological_order() {
            value.0.borrow_mut().grad = 0.0;
        }
    }

    /// Backpropagates from this value, accumulating d(self)/d(node) into every node
    /// of the graph which produced it
    pub fn backward(&self) {
        // d out / d out = 1
        self.0.borrow_mut().grad = 1.0;

        // reversed so that a node's gradient is complete before it is pushed to its operands
        for value in self.topological_order().into_iter().rev() {
            if let Some(op) = value.op() {
                op.backward(&value.operands(), &value);
            }
        }
    }

    /// All nodes reachable from this one, every node placed after all of its operands.
    ///
    /// Iterative so that long chains (e.g. a 784-wide dot product) cannot overflow the stack.
    fn topological_order(&self) -> Vec<Value> {
        let mut order = vec![];
        let mut visited: HashSet<*const RefCell<Node>> = HashSet::new();
        let mut stack = vec![(self.clone(), false)];

        while let Some((value, operands_done)) = stack.pop() {
            if operands_done {
                order.push(value);
                continue;
            }
            if !visited.insert(Rc::as_ptr(&value.0)) {
                continue;
            }
            stack.push((value.clone(), true));
            for operand in value.0.borrow().operands.iter() {
                if !visited.contains(&Rc::as_ptr(operand)) {
                    stack.push((Value(operand.clone()), false));
                }
            }
        }
        order
    }
}

// Various operations on values
impl Value {
    pub fn pow(&self, exponent: &Value) -> Value {
        Value::derived(self.data().powf(exponent.data()), Op::Pow, &[self, exponent])
    }

    /// Raises to a constant power
    pub fn powf(&self, exponent: f32) -> Value {
        self.pow(&Value::new(exponent))
    }

    pub fn relu(&self) -> Value {
        Value::derived(self.data().max(0.0), Op::ReLU, &[self])
    }

    pub fn exp(&self) -> Value {
        Value::derived(self.data().exp(), Op::Exp, &[self])
    }

    /// Natural logarithm
    pub fn ln(&self) -> Value {
        Value::derived(self.data().ln(), Op::Ln, &[self])
    }

    /// Sums any number of values into a single node.
    ///
    /// One n-ary node instead of a chain of additions keeps the graph shallow.
    pub fn sum(values: &[Value]) -> Value {
        let data = values.iter().map(|v| v.data()).sum();
        let operands = values.iter().collect::<Vec<_>>();
        Value::derived(data, Op::Sum, &operands)
    }

    /// Arithmetic mean, `NaN` for an empty slice
    pub fn mean(values: &[Value]) -> Value {
        Value::sum(values) / Value::new(values.len() as f32)
    }
}

// pretty print a value and its children recursively in a JSON-like format
impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_value(value: &Value, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let indent_str = " ".repeat(indent);
            let indent_inner = " ".repeat(indent + 2);
            let grad_fn = value.op().map_or("None", |op| op.grad_fn_name());
            writeln!(f, "{}{{", indent_str)?;
            writeln!(f, "{}\"data\": {},", indent_inner, value.data())?;
            writeln!(f, "{}\"grad\": {},", indent_inner, value.grad())?;
            writeln!(f, "{}\"grad_fn\": \"{}\",", indent_inner, grad_fn)?;
            writeln!(f, "{}\"children\": [", indent_inner)?;
            let operands = value.operands();
            for (i, child) in operands.iter().enumerate() {
                fmt_value(child, indent + 4, f)?;
                if i < operands.len() - 1 {
                    writeln!(f, ",")?;
                } else {
                    writeln!(f)?;
                }
            }
            writeln!(f, "{}]", indent_inner)?;
            write!(f, "{}}}", indent_str)
        }
        fmt_value(self, 0, f)
    }
}

impl Add for &Value {
    type Output = Value;

    fn add(self, other: &Value) -> Value {
        Value::derived(self.data() + other.data(), Op::Add, &[self, other])
    }
}

impl Sub for &Value {
    type Output = Value;

    fn sub(self, other: &Value) -> Value {
        Value::derived(self.data() - other.data(), Op::Sub, &[self, other])
    }
}

impl Mul for &Value {
    type Output = Value;

    fn mul(self, other: &Value) -> Value {
        Value::derived(self.data() * other.data(), Op::Mul, &[self, other])
    }
}

impl Div for &Value {
    type Output = Value;

    fn div(self, other: &Value) -> Value {
        Value::derived(self.data() / other.data(), Op::Div, &[self, other])
    }
}

impl Neg for &Value {
    type Output = Value;

    fn neg(self) -> Value {
        Value::derived(-self.data(), Op::Neg, &[self])
    }
}

impl Neg for Value {
    type Output = Value;

    fn neg(self) -> Value {
        -&self
    }
}

impl Sum for Value {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Value::sum(&iter.collect::<Vec<_>>())
    }
}

/// Convenience macro to implement operations on `[Value]` when ownership can be transferred
macro_rules! impl_arithmetic(
    ($trait:ident, $trait_method:ident, $operator:tt, $struct:ident) => {
        impl $trait for $struct {
            type Output = Self;

            fn $trait_method(self, other: Self) -> Self {
                &self $operator &other
            }
        }
    }
);
impl_arithmetic!(Add, add, +, Value);
impl_arithmetic!(Sub, sub, -, Value);
impl_arithmetic!(Mul, mul, *, Value);
impl_arithmetic!(Div, div, /, Value);

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

// unfortunate that there isn't a blanket impl for AsRef<T> for T
// <https://doc.rust-lang.org/std/convert/trait.AsRef.html#reflexivity>
impl AsRef<Value> for Value {
    fn as_ref(&self) -> &Value {
        self
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    // 32 bit floats, roughly 7 decimal digits of precision
    data: f32,
    /// gradient of the output with respect to this value
    grad: f32,
    /// Inputs of the node in the forward pass
    operands: Vec<SharedNode>,
    /// `None` when the value is a leaf node
    op: Option<Op>,
}
