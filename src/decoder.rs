//! # Decoder
//!
//! Maps the recurrent output to a per-step delta: rotation velocity for every
//! joint, root velocity, and foot-contact probabilities. The delta head and
//! the contact head share a two-layer PLU trunk.

use candle_core::Tensor;
use candle_nn::{linear, ops, Linear, Module, VarBuilder};

use crate::dims::{FeatureDims, Features, Hidden, ROOT_DIM};
use crate::plu::Plu;
use crate::InbetweenResult;

/// One decoded step, all `(batch, width)`
#[derive(Debug, Clone)]
pub struct DecodedDelta {
    /// Added to the current flattened rotations
    pub rotation_velocity: Tensor,
    /// Added to the current root position
    pub root_velocity: Tensor,
    /// Sigmoid of the contact logits
    pub contact: Tensor,
}

#[derive(Debug)]
pub struct Decoder {
    fc0: Linear,
    fc1: Linear,
    fc2: Linear,
    fc_contact: Linear,
    activation: Plu,
    dims: FeatureDims,
}

impl Decoder {
    pub fn new(
        dims: FeatureDims,
        hidden_dims: (usize, usize),
        activation: Plu,
        vb: VarBuilder,
    ) -> InbetweenResult<Self> {
        let fc0 = linear(dims.hidden_width(), hidden_dims.0, vb.pp("fc0"))?;
        let fc1 = linear(hidden_dims.0, hidden_dims.1, vb.pp("fc1"))?;
        let fc2 = linear(hidden_dims.1, dims.delta_width(), vb.pp("fc2"))?;
        let fc_contact = linear(hidden_dims.1, dims.contact_dim, vb.pp("fc_contact"))?;
        Ok(Self {
            fc0,
            fc1,
            fc2,
            fc_contact,
            activation,
            dims,
        })
    }

    pub fn output_dim(&self) -> usize {
        self.dims.delta_width()
    }

    pub fn decode(&self, hidden: &Features<Hidden>) -> InbetweenResult<DecodedDelta> {
        let h = self.activation.forward(&self.fc0.forward(hidden.tensor())?)?;
        let h = self.activation.forward(&self.fc1.forward(&h)?)?;

        let delta = self.fc2.forward(&h)?;
        let rotation_width = self.dims.rotation_width();
        let rotation_velocity = delta.narrow(1, 0, rotation_width)?;
        let root_velocity = delta.narrow(1, rotation_width, ROOT_DIM)?;
        let contact = ops::sigmoid(&self.fc_contact.forward(&h)?)?;

        Ok(DecodedDelta {
            rotation_velocity,
            root_velocity,
            contact,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_decoder_head_widths() {
        let device = Device::Cpu;
        let dims = FeatureDims::new(3, 4, 2, 4);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = Decoder::new(dims, (16, 8), Plu::default(), vb).unwrap();
        assert_eq!(decoder.output_dim(), 15);

        let hidden = Features::<Hidden>::new(
            Tensor::randn(0f32, 1.0, (2, dims.hidden_width()), &device).unwrap(),
            &dims,
        )
        .unwrap();
        let delta = decoder.decode(&hidden).unwrap();
        assert_eq!(delta.rotation_velocity.dims(), &[2, 12]);
        assert_eq!(delta.root_velocity.dims(), &[2, 3]);
        assert_eq!(delta.contact.dims(), &[2, 4]);

        let contact: Vec<f32> = delta.contact.flatten_all().unwrap().to_vec1().unwrap();
        assert!(contact.iter().all(|c| (0.0..=1.0).contains(c)));
    }

    #[test]
    fn test_zero_weights_give_zero_delta() {
        let device = Device::Cpu;
        let dims = FeatureDims::new(2, 2, 2, 4);
        let vb = VarBuilder::zeros(DType::F32, &device);
        let decoder = Decoder::new(dims, (8, 8), Plu::default(), vb).unwrap();
        let hidden = Features::<Hidden>::new(
            Tensor::ones((1, dims.hidden_width()), DType::F32, &device).unwrap(),
            &dims,
        )
        .unwrap();

        let delta = decoder.decode(&hidden).unwrap();
        let rot: Vec<f32> = delta.rotation_velocity.flatten_all().unwrap().to_vec1().unwrap();
        let contact: Vec<f32> = delta.contact.flatten_all().unwrap().to_vec1().unwrap();
        assert!(rot.iter().all(|v| *v == 0.0));
        assert!(contact.iter().all(|c| (*c - 0.5).abs() < 1e-6));
    }
}
