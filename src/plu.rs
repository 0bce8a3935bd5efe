//! # PLU - Piecewise Linear Unit
//!
//! The activation used throughout the encoders and the decoder. Identity
//! inside `[-c, c]`, slope `alpha` outside, so it neither saturates like tanh
//! nor explodes like an unbounded ReLU stack.
//!
//! ## Formula
//! ```text
//! PLU(x) = max(alpha * (x + c) - c, min(alpha * (x - c) + c, x))
//! ```

use candle_core::{Result as CandleResult, Tensor};
use candle_nn::Module;

#[derive(Debug, Clone, Copy)]
pub struct Plu {
    alpha: f64,
    c: f64,
}

impl Plu {
    pub fn new(alpha: f64, c: f64) -> Self {
        Self { alpha, c }
    }
}

impl Default for Plu {
    fn default() -> Self {
        Self::new(0.1, 1.0)
    }
}

impl Module for Plu {
    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        let upper = x.affine(self.alpha, self.c - self.alpha * self.c)?;
        let lower = x.affine(self.alpha, self.alpha * self.c - self.c)?;
        lower.maximum(&x.minimum(&upper)?)
    }
}
