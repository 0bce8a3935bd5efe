//! # Model Checkpointing
//!
//! Save and load the in-betweening network, one blob per module role.
//!
//! ## File Format
//!
//! ```text
//! checkpoint_dir/
//! ├── config.json               # ModelSpec and metadata
//! ├── state_encoder.safetensors
//! ├── offset_encoder.safetensors
//! ├── target_encoder.safetensors
//! ├── recurrent_core.safetensors
//! └── decoder.safetensors
//! ```
//!
//! Loading checks that every blob exists before touching any of them, so a
//! partial checkpoint never yields a half-initialised model.

use std::fs;
use std::path::Path;

use candle_core::Device;

use crate::error::InbetweenError;
use crate::model::{InbetweenModel, ModelSpec, ModelWeights, ModuleRole};
use crate::InbetweenResult;

/// Metadata stored with checkpoints
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    pub spec: ModelSpec,
    /// Training epoch when saved
    pub epoch: Option<usize>,
    /// Seconds since the Unix epoch
    pub timestamp: String,
    pub version: String,
}

impl CheckpointMetadata {
    pub fn new(spec: ModelSpec) -> Self {
        Self {
            spec,
            epoch: None,
            timestamp: unix_timestamp(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_epoch(mut self, epoch: usize) -> Self {
        self.epoch = Some(epoch);
        self
    }
}

fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default()
}

/// Write `config.json` and one safetensors blob per role
pub fn save_checkpoint(
    spec: &ModelSpec,
    weights: &ModelWeights,
    checkpoint_dir: impl AsRef<Path>,
    epoch: Option<usize>,
) -> InbetweenResult<()> {
    let dir = checkpoint_dir.as_ref();
    fs::create_dir_all(dir)
        .map_err(|e| InbetweenError::Io(format!("Failed to create checkpoint dir: {}", e)))?;

    let mut metadata = CheckpointMetadata::new(*spec);
    if let Some(e) = epoch {
        metadata = metadata.with_epoch(e);
    }
    let config_json = serde_json::to_string_pretty(&metadata)?;
    fs::write(dir.join("config.json"), config_json)
        .map_err(|e| InbetweenError::Io(format!("Failed to write config: {}", e)))?;

    for role in ModuleRole::ALL {
        let map = weights.get(role).ok_or_else(|| InbetweenError::MissingWeights {
            role: role.name().to_string(),
            path: "<in memory>".to_string(),
        })?;
        map.save(dir.join(role.file_name())).map_err(|e| {
            InbetweenError::SerializationError(format!("Failed to save {}: {}", role.name(), e))
        })?;
    }

    log::info!("Saved checkpoint to {:?}", dir);
    Ok(())
}

/// Fail with the first role whose blob is absent
pub fn verify_weight_files(dir: impl AsRef<Path>) -> InbetweenResult<()> {
    let dir = dir.as_ref();
    for role in ModuleRole::ALL {
        let path = dir.join(role.file_name());
        if !path.is_file() {
            return Err(InbetweenError::MissingWeights {
                role: role.name().to_string(),
                path: path.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Build the network for `spec` and fill it from the blobs in `dir`.
///
/// Loading is idempotent: the blobs overwrite every parameter.
pub fn load_weights(
    spec: ModelSpec,
    dir: impl AsRef<Path>,
    device: &Device,
) -> InbetweenResult<(InbetweenModel, ModelWeights)> {
    let dir = dir.as_ref();
    verify_weight_files(dir)?;

    let (model, mut weights) = InbetweenModel::new_random(spec, device)?;
    for role in ModuleRole::ALL {
        let path = dir.join(role.file_name());
        if let Some(map) = weights.get_mut(role) {
            map.load(&path).map_err(|e| {
                InbetweenError::SerializationError(format!(
                    "Failed to load {} from {:?}: {}",
                    role.name(),
                    path,
                    e
                ))
            })?;
        }
    }

    log::info!("Loaded weights for {} modules from {:?}", ModuleRole::ALL.len(), dir);
    Ok((model, weights))
}

/// Load a checkpoint written by [`save_checkpoint`]
pub fn load_checkpoint(
    checkpoint_dir: impl AsRef<Path>,
    device: &Device,
) -> InbetweenResult<(InbetweenModel, ModelWeights, CheckpointMetadata)> {
    let dir = checkpoint_dir.as_ref();
    let config_str = fs::read_to_string(dir.join("config.json"))
        .map_err(|e| InbetweenError::Io(format!("Failed to read config: {}", e)))?;
    let metadata: CheckpointMetadata = serde_json::from_str(&config_str)?;

    let (model, weights) = load_weights(metadata.spec, dir, device)?;
    Ok((model, weights, metadata))
}

pub fn checkpoint_exists(checkpoint_dir: impl AsRef<Path>) -> bool {
    let dir = checkpoint_dir.as_ref();
    dir.join("config.json").exists() && verify_weight_files(dir).is_ok()
}
