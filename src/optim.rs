//! Optimizers

use clap::ValueEnum;

use crate::value::Value;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
    /// The parameters being optimized, in the order they were registered
    fn params(&self) -> &[Value];
}

/// Selects the update rule from the command line
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum OptimKind {
    Sgd,
    Adam,
}

/// Builds an optimizer of the given kind over `params`.
/// `momentum` only applies to SGD.
pub fn build(kind: OptimKind, params: Vec<Value>, lr: f32, momentum: f32) -> Box<dyn Optim> {
    match kind {
        OptimKind::Sgd => Box::new(SGD::new(params, lr).with_momentum(momentum)),
        OptimKind::Adam => Box::new(Adam::new(params, lr)),
    }
}

/// SGD, optionally with momentum
pub struct SGD {
    params: Vec<Value>,
    // constant, no learning rate schedule
    lr: f32,
    momentum: f32,
    // velocity per parameter
    velocity: Vec<f32>,
}

impl SGD {
    pub fn new(params: Vec<Value>, lr: f32) -> Self {
        let velocity = vec![0.0; params.len()];
        Self {
            params,
            lr,
            momentum: 0.0,
            velocity,
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    #[cfg(test)]
    fn velocities(&self) -> &[f32] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        for (param, velocity) in self.params.iter_mut().zip(self.velocity.iter_mut()) {
            // v = mu * v - lr * g, p = p + v
            *velocity = self.momentum * *velocity - self.lr * param.grad();
            let new_val = param.data() + *velocity;
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }

    fn params(&self) -> &[Value] {
        &self.params
    }
}

/// Adam with bias corrected first and second moment estimates
pub struct Adam {
    params: Vec<Value>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    // number of steps taken, for bias correction
    t: i32,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    pub fn new(params: Vec<Value>, lr: f32) -> Self {
        let n = params.len();
        Self {
            params,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: vec![0.0; n],
            v: vec![0.0; n],
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }
}

impl Optim for Adam {
    fn step(&mut self) {
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);
        for (idx, param) in self.params.iter_mut().enumerate() {
            let g = param.grad();
            self.m[idx] = self.beta1 * self.m[idx] + (1.0 - self.beta1) * g;
            self.v[idx] = self.beta2 * self.v[idx] + (1.0 - self.beta2) * g * g;
            let m_hat = self.m[idx] / bias1;
            let v_hat = self.v[idx] / bias2;
            let new_val = param.data() - self.lr * m_hat / (v_hat.sqrt() + self.eps);
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }

    fn params(&self) -> &[Value] {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;

    #[test]
    fn test_sgd_no_momentum() {
        let a = Value::new(1.0);
        let b = Value::new(2.0);
        let c = &a + &b;
        c.backward();

        let mut optim = SGD::new(vec![a.clone(), b.clone(), c.clone()], 0.1);
        optim.step();
        assert_eq!(a.grad(), 1.0);
        assert_eq!(b.grad(), 1.0);
        assert_eq!(c.grad(), 1.0);
        assert_eq_float!(a.data(), 0.9);
        assert_eq_float!(b.data(), 1.9);
        assert_eq_float!(c.data(), 2.9);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let a = Value::new(1.0);
        let b = Value::new(2.0);
        let c = &a + &b;
        c.backward();

        let mut optim = SGD::new(vec![a.clone(), b.clone()], 0.1).with_momentum(0.9);
        optim.step();
        assert_eq_float!(a.data(), 0.9);
        assert_eq_float!(b.data(), 1.9);
        assert_eq_float!(optim.velocities()[0], -0.1);
        optim.step();
        assert_eq_float!(a.data(), 0.71);
        assert_eq_float!(b.data(), 1.71);
        assert_eq_float!(optim.velocities()[1], -0.19);
    }

    #[test]
    fn test_zero_grad() {
        let a = Value::new(1.0);
        let b = &a * &Value::new(4.0);
        b.backward();
        assert_eq!(a.grad(), 4.0);

        let mut optim = SGD::new(vec![a.clone()], 0.1);
        optim.zero_grad();
        assert_eq!(a.grad(), 0.0);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        // with bias correction the first step is lr * g / |g|
        let a = Value::new(1.0);
        let b = Value::new(-1.0);
        let loss = &(&a * &Value::new(3.0)) + &(&b * &Value::new(-0.5));
        loss.backward();

        let mut optim = Adam::new(vec![a.clone(), b.clone()], 0.01);
        optim.step();
        assert_eq_float!(a.data(), 0.99);
        assert_eq_float!(b.data(), -0.99);
    }

    #[test]
    fn test_adam_minimises_quadratic() {
        let x = Value::new(5.0);
        let mut optim = Adam::new(vec![x.clone()], 0.1).with_betas(0.9, 0.99);
        for _ in 0..500 {
            let loss = x.powf(2.0);
            loss.backward();
            optim.step();
            optim.zero_grad();
        }
        assert!(x.data().abs() < 0.5, "x = {}", x.data());
    }

    #[test]
    fn test_build_dispatches_on_kind() {
        let p = Value::new(1.0);
        let optim = build(OptimKind::Adam, vec![p.clone()], 0.01, 0.0);
        assert_eq!(optim.params().len(), 1);
    }
}
