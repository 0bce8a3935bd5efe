//! # In-betweening Network
//!
//! The five trainable modules plus the time encoder, grouped by role.
//!
//! ```text
//! state ──► StateEncoder ──► +pe(t) ─┐
//! offset ─► OffsetEncoder ─► +pe(t) ─┼─► ‖ condition ─► LSTM ─► Decoder ─► delta
//! target ─► TargetEncoder ─► +pe(t) ─┘
//! ```
//!
//! Each role owns its own parameter set so weights can be persisted and
//! loaded one blob per role.

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::decoder::Decoder;
use crate::dims::{FeatureDims, Offset, State, Target};
use crate::encoder::{FeatureEncoder, TimeEncoder};
use crate::plu::Plu;
use crate::recurrent::RecurrentCore;
use crate::InbetweenResult;

/// Trainable module roles, each persisted as its own blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleRole {
    StateEncoder,
    OffsetEncoder,
    TargetEncoder,
    RecurrentCore,
    Decoder,
}

impl ModuleRole {
    pub const ALL: [ModuleRole; 5] = [
        ModuleRole::StateEncoder,
        ModuleRole::OffsetEncoder,
        ModuleRole::TargetEncoder,
        ModuleRole::RecurrentCore,
        ModuleRole::Decoder,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModuleRole::StateEncoder => "state_encoder",
            ModuleRole::OffsetEncoder => "offset_encoder",
            ModuleRole::TargetEncoder => "target_encoder",
            ModuleRole::RecurrentCore => "recurrent_core",
            ModuleRole::Decoder => "decoder",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.safetensors", self.name())
    }
}

/// Everything needed to rebuild the network structure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub dims: FeatureDims,
    pub encoder_hidden_dim: usize,
    pub decoder_hidden_dims: (usize, usize),
    pub plu_alpha: f64,
    pub plu_c: f64,
    /// Longest window the time encoder covers
    pub max_len: usize,
}

impl ModelSpec {
    pub fn from_config(
        config: &ModelConfig,
        num_joints: usize,
        contact_dim: usize,
        condition_dim: usize,
        max_len: usize,
    ) -> Self {
        Self {
            dims: FeatureDims::new(num_joints, contact_dim, condition_dim, config.embedding_dim),
            encoder_hidden_dim: config.encoder_hidden_dim,
            decoder_hidden_dims: config.decoder_hidden_dims,
            plu_alpha: config.plu_alpha,
            plu_c: config.plu_c,
            max_len,
        }
    }

    pub fn activation(&self) -> Plu {
        Plu::new(self.plu_alpha, self.plu_c)
    }
}

/// Parameter sets of a randomly initialised or loaded model, by role
#[derive(Default)]
pub struct ModelWeights {
    maps: Vec<(ModuleRole, VarMap)>,
}

impl ModelWeights {
    pub fn get(&self, role: ModuleRole) -> Option<&VarMap> {
        self.maps.iter().find(|(r, _)| *r == role).map(|(_, m)| m)
    }

    pub fn get_mut(&mut self, role: ModuleRole) -> Option<&mut VarMap> {
        self.maps.iter_mut().find(|(r, _)| *r == role).map(|(_, m)| m)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModuleRole, &VarMap)> {
        self.maps.iter().map(|(r, m)| (*r, m))
    }
}

#[derive(Debug)]
pub struct InbetweenModel {
    pub(crate) spec: ModelSpec,
    pub(crate) state_encoder: FeatureEncoder<State>,
    pub(crate) offset_encoder: FeatureEncoder<Offset>,
    pub(crate) target_encoder: FeatureEncoder<Target>,
    pub(crate) time_encoder: TimeEncoder,
    pub(crate) core: RecurrentCore,
    pub(crate) decoder: Decoder,
    pub(crate) device: Device,
}

impl InbetweenModel {
    /// Build every module from the var builder its role maps to
    pub fn new<'a>(
        spec: ModelSpec,
        device: &Device,
        mut vb_for: impl FnMut(ModuleRole) -> VarBuilder<'a>,
    ) -> InbetweenResult<Self> {
        let dims = spec.dims;
        let activation = spec.activation();
        Ok(Self {
            state_encoder: FeatureEncoder::new(
                dims,
                spec.encoder_hidden_dim,
                activation,
                vb_for(ModuleRole::StateEncoder),
            )?,
            offset_encoder: FeatureEncoder::new(
                dims,
                spec.encoder_hidden_dim,
                activation,
                vb_for(ModuleRole::OffsetEncoder),
            )?,
            target_encoder: FeatureEncoder::new(
                dims,
                spec.encoder_hidden_dim,
                activation,
                vb_for(ModuleRole::TargetEncoder),
            )?,
            time_encoder: TimeEncoder::new(dims, spec.max_len, device)?,
            core: RecurrentCore::new(dims, vb_for(ModuleRole::RecurrentCore))?,
            decoder: Decoder::new(
                dims,
                spec.decoder_hidden_dims,
                activation,
                vb_for(ModuleRole::Decoder),
            )?,
            spec,
            device: device.clone(),
        })
    }

    /// Randomly initialised model with one `VarMap` per role
    pub fn new_random(spec: ModelSpec, device: &Device) -> InbetweenResult<(Self, ModelWeights)> {
        let weights = ModelWeights {
            maps: ModuleRole::ALL.iter().map(|r| (*r, VarMap::new())).collect(),
        };
        let model = Self::new(spec, device, |role| {
            let map = weights
                .get(role)
                .map(|m| VarBuilder::from_varmap(m, DType::F32, device));
            map.unwrap_or_else(|| VarBuilder::zeros(DType::F32, device))
        })?;
        Ok((model, weights))
    }

    /// All-zero weights; the decoder then predicts zero motion
    pub fn zeros(spec: ModelSpec, device: &Device) -> InbetweenResult<Self> {
        Self::new(spec, device, |_| VarBuilder::zeros(DType::F32, device))
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn dims(&self) -> &FeatureDims {
        &self.spec.dims
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names() {
        let names: Vec<&str> = ModuleRole::ALL.iter().map(|r| r.name()).collect();
        assert_eq!(
            names,
            vec!["state_encoder", "offset_encoder", "target_encoder", "recurrent_core", "decoder"]
        );
        assert_eq!(ModuleRole::Decoder.file_name(), "decoder.safetensors");
    }

    #[test]
    fn test_new_random_has_all_roles() {
        let device = Device::Cpu;
        let config = crate::config::InbetweenConfig::tiny();
        let spec = ModelSpec::from_config(&config.model, 5, 4, 2, 10);
        let (model, weights) = InbetweenModel::new_random(spec, &device).unwrap();

        assert_eq!(model.dims().recurrent_input_width(), 3 * 16 + 2);
        for role in ModuleRole::ALL {
            let map = weights.get(role).unwrap();
            assert!(!map.all_vars().is_empty(), "{} has no parameters", role.name());
        }
        let lstm_vars = weights.get(ModuleRole::RecurrentCore).unwrap().data().lock().unwrap().len();
        assert_eq!(lstm_vars, 4);
    }
}
