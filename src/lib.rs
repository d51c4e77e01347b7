//! Trains a small feed-forward classifier on MNIST style images with a scalar,
//! PyTorch-like reverse-mode autograd engine.

pub mod dataloader;
pub mod loss;
pub mod mnist;
pub mod nn;
pub mod ops;
pub mod optim;
pub mod tensor;
pub mod train;
pub mod value;
pub mod viz;
