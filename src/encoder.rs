//! # Feature Encoders and Time Encoding
//!
//! Three encoders share one architecture, a two-layer PLU MLP, and differ only
//! in input width and weights. [`FeatureEncoder`] is generic over the
//! [`FeatureKind`] it accepts, so the state, offset and target encoders are
//! one component instantiated three times.
//!
//! [`TimeEncoder`] then adds a sinusoidal code of the timestep to each
//! embedding, precomputed for every step of a window.

use std::marker::PhantomData;

use candle_core::{Device, IndexOp, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::dims::{Embedded, FeatureDims, FeatureKind, Features};
use crate::error::InbetweenError;
use crate::plu::Plu;
use crate::InbetweenResult;

/// Two-layer MLP mapping one feature stage to the embedding space
#[derive(Debug)]
pub struct FeatureEncoder<K> {
    fc0: Linear,
    fc1: Linear,
    activation: Plu,
    dims: FeatureDims,
    _kind: PhantomData<K>,
}

impl<K: FeatureKind> FeatureEncoder<K> {
    pub fn new(
        dims: FeatureDims,
        hidden_dim: usize,
        activation: Plu,
        vb: VarBuilder,
    ) -> InbetweenResult<Self> {
        let fc0 = linear(K::width(&dims), hidden_dim, vb.pp("fc0"))?;
        let fc1 = linear(hidden_dim, dims.embedding_dim, vb.pp("fc1"))?;
        Ok(Self {
            fc0,
            fc1,
            activation,
            dims,
            _kind: PhantomData,
        })
    }

    pub fn input_dim(&self) -> usize {
        K::width(&self.dims)
    }

    pub fn output_dim(&self) -> usize {
        self.dims.embedding_dim
    }

    pub fn encode(&self, input: &Features<K>) -> InbetweenResult<Features<Embedded>> {
        let h = self.activation.forward(&self.fc0.forward(input.tensor())?)?;
        let h = self.activation.forward(&self.fc1.forward(&h)?)?;
        Features::new(h, &self.dims)
    }
}

/// Sinusoidal timestep code added to embeddings.
///
/// ```text
/// pe[t, 2i]     = sin(t / 10000^(2i/d))
/// pe[t, 2i + 1] = cos(t / 10000^(2i/d))
/// ```
#[derive(Debug, Clone)]
pub struct TimeEncoder {
    table: Tensor,
    max_len: usize,
    dims: FeatureDims,
}

impl TimeEncoder {
    pub fn new(dims: FeatureDims, max_len: usize, device: &Device) -> InbetweenResult<Self> {
        let d = dims.embedding_dim;
        let mut table = vec![0.0f32; max_len * d];
        for t in 0..max_len {
            for i in (0..d).step_by(2) {
                let freq = (-(10000.0f64.ln()) * i as f64 / d as f64).exp();
                let angle = t as f64 * freq;
                table[t * d + i] = angle.sin() as f32;
                if i + 1 < d {
                    table[t * d + i + 1] = angle.cos() as f32;
                }
            }
        }
        let table = Tensor::from_vec(table, (max_len, d), device)?;
        Ok(Self {
            table,
            max_len,
            dims,
        })
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// The code for timestep `t`, shape `(embedding_dim,)`
    pub fn code(&self, t: usize) -> InbetweenResult<Tensor> {
        if t >= self.max_len {
            return Err(InbetweenError::ContractViolation(format!(
                "timestep {} beyond precomputed range {}",
                t, self.max_len
            )));
        }
        Ok(self.table.i(t)?)
    }

    pub fn encode(&self, embedding: &Features<Embedded>, t: usize) -> InbetweenResult<Features<Embedded>> {
        let code = self.code(t)?.to_device(embedding.tensor().device())?;
        Features::new(embedding.tensor().broadcast_add(&code)?, &self.dims)
    }
}
