//! A small two dimensional grid of values, enough to walk through autograd on
//! matrices the way one would with PyTorch tensors

use std::fmt::{self, Display};

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::value::Value;

/// Row-major `rows x cols` matrix of [`Value`]s
#[derive(Debug, Clone)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    values: Vec<Value>,
}

impl Tensor {
    /// Builds a tensor from row-major data, `None` if `data.len() != rows * cols`
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Option<Self> {
        if data.len() != rows * cols {
            return None;
        }
        Some(Self {
            rows,
            cols,
            values: data.into_iter().map(Value::new).collect(),
        })
    }

    /// Samples every element from the standard normal distribution
    pub fn randn<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Self {
        let values = (0..rows * cols)
            .map(|_| Value::new(StandardNormal.sample(rng)))
            .collect();
        Self { rows, cols, values }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn data(&self) -> Vec<f32> {
        self.values.iter().map(Value::data).collect()
    }

    pub fn grad(&self) -> Vec<f32> {
        self.values.iter().map(Value::grad).collect()
    }

    /// Element-wise power by a constant
    pub fn powf(&self, exponent: f32) -> Tensor {
        self.map(|v| v.powf(exponent))
    }

    /// Element-wise map producing a new tensor of the same shape
    pub fn map(&self, f: impl Fn(&Value) -> Value) -> Tensor {
        Tensor {
            rows: self.rows,
            cols: self.cols,
            values: self.values.iter().map(f).collect(),
        }
    }

    /// Mean over all elements, reduced to a single scalar node
    pub fn mean(&self) -> Value {
        Value::mean(&self.values)
    }

    /// Same shape tensor of the current gradients, detached from the graph
    pub fn grad_tensor(&self) -> Tensor {
        Tensor {
            rows: self.rows,
            cols: self.cols,
            values: self.grad().into_iter().map(Value::new).collect(),
        }
    }
}

impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor([")?;
        for (r, row) in self.values.chunks(self.cols.max(1)).enumerate() {
            if r > 0 {
                write!(f, ",\n        ")?;
            }
            let cells = row
                .iter()
                .map(|v| format!("{:>8.4}", v.data()))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "[{}]", cells)?;
        }
        write!(f, "])")
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::assert_eq_float;

    #[test]
    fn test_mean_of_squares_grad_is_half_x() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let x = Tensor::randn(2, 2, &mut rng);
        let y = x.powf(2.0);
        let z = y.mean();
        z.backward();

        // z = 1/n * sum(x^2) => dz/dx = 2x/n = x/2 for n = 4
        for (g, d) in x.grad().iter().zip(x.data()) {
            assert_eq_float!(*g, d / 2.0);
        }
    }

    #[test]
    fn test_from_vec_checks_shape() {
        assert!(Tensor::from_vec(2, 3, vec![0.0; 5]).is_none());
        let t = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.shape(), (2, 3));
        assert_eq_float!(t.mean().data(), 3.5);
    }

    #[test]
    fn test_display() {
        let t = Tensor::from_vec(2, 2, vec![1.0, -2.0, 0.5, 0.0]).unwrap();
        let printed = t.to_string();
        assert!(printed.starts_with("tensor([["));
        assert!(printed.contains("-2.0000"));
        assert_eq!(printed.lines().count(), 2);
    }
}
