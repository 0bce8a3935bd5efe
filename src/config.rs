//! # Configuration
//!
//! Every knob of the engine is enumerated once in [`InbetweenConfig`] and read
//! from a JSON file at startup. Defaults reproduce the LAFAN1 setup: 50-frame
//! windows, subjects 1-4 for training with stride 10, subject 5 for testing
//! with stride 40.

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::InbetweenError;
use crate::window::FacingNormalization;
use crate::InbetweenResult;

/// Which split of the data a dataset is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Split {
    Train,
    Test,
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// Data preparation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding clip JSON files
    pub clip_dir: PathBuf,
    /// Skeleton JSON file
    pub skeleton_path: PathBuf,
    /// Subjects used for the training split
    pub train_subjects: Vec<String>,
    /// Subjects used for the test split
    pub test_subjects: Vec<String>,
    /// Frames per window
    pub window_length: usize,
    /// Offset between consecutive training windows
    pub train_stride: usize,
    /// Offset between consecutive test windows
    pub test_stride: usize,
    /// Squared foot velocity below which a foot counts as planted
    pub contact_velocity_threshold: f32,
    /// Action keywords mapped to condition slots, in slot order
    pub condition_vocabulary: Vec<String>,
    /// Flip quaternions into a continuous hemisphere along time
    pub enforce_quat_continuity: bool,
    /// Turn each window so the root faces +X on a key frame; `null` disables
    #[serde(default = "default_facing")]
    pub facing: Option<FacingNormalization>,
}

fn default_facing() -> Option<FacingNormalization> {
    Some(FacingNormalization::default())
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            clip_dir: PathBuf::from("data/clips"),
            skeleton_path: PathBuf::from("data/skeleton.json"),
            train_subjects: (1..=4).map(|i| format!("subject{}", i)).collect(),
            test_subjects: vec!["subject5".to_string()],
            window_length: 50,
            train_stride: 10,
            test_stride: 40,
            contact_velocity_threshold: 0.02,
            condition_vocabulary: vec!["dance".to_string(), "jump".to_string()],
            enforce_quat_continuity: true,
            facing: default_facing(),
        }
    }
}

impl DataConfig {
    pub fn subjects(&self, split: Split) -> &[String] {
        match split {
            Split::Train => &self.train_subjects,
            Split::Test => &self.test_subjects,
        }
    }

    pub fn stride(&self, split: Split) -> usize {
        match split {
            Split::Train => self.train_stride,
            Split::Test => self.test_stride,
        }
    }
}

/// Network widths and weight location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Output width of each feature encoder
    pub embedding_dim: usize,
    /// Hidden width inside each feature encoder
    pub encoder_hidden_dim: usize,
    /// Hidden widths of the decoder trunk
    pub decoder_hidden_dims: (usize, usize),
    /// PLU slope outside the linear band
    pub plu_alpha: f64,
    /// PLU half-width of the linear band
    pub plu_c: f64,
    pub batch_size: usize,
    /// Directory holding one safetensors blob per module role
    pub weight_dir: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 256,
            encoder_hidden_dim: 512,
            decoder_hidden_dims: (512, 256),
            plu_alpha: 0.1,
            plu_c: 1.0,
            batch_size: 32,
            weight_dir: PathBuf::from("weights"),
        }
    }
}

/// Generation loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Value written into every condition channel of the step being generated
    pub condition_marker: f32,
    /// Lower bound on a quaternion norm during renormalisation
    pub quat_epsilon: f64,
    /// Reconstruct global positions after each step
    pub compute_global_positions: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            condition_marker: 3.0,
            quat_epsilon: 1e-8,
            compute_global_positions: true,
        }
    }
}

/// Device selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub gpu_id: Option<usize>,
}

impl DeviceConfig {
    /// Resolve to a candle device, falling back to CPU
    pub fn device(&self) -> Device {
        match self.gpu_id {
            Some(id) => match Device::cuda_if_available(id) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("CUDA device {} unavailable ({}), using CPU", id, e);
                    Device::Cpu
                }
            },
            None => Device::Cpu,
        }
    }
}

/// Frame export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    /// Batch element written by the exporter
    pub batch_index: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("results"),
            batch_index: 0,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InbetweenConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

impl InbetweenConfig {
    /// Small widths and short windows for tests
    pub fn tiny() -> Self {
        let mut config = Self::default();
        config.data.window_length = 10;
        config.data.train_stride = 3;
        config.data.test_stride = 5;
        config.model.embedding_dim = 16;
        config.model.encoder_hidden_dim = 24;
        config.model.decoder_hidden_dims = (24, 16);
        config.model.batch_size = 4;
        config
    }

    pub fn from_file(path: impl AsRef<Path>) -> InbetweenResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| InbetweenError::Io(format!("Failed to read config {:?}: {}", path, e)))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> InbetweenResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn validate(&self) -> InbetweenResult<()> {
        let data = &self.data;
        if data.window_length < 2 {
            return Err(InbetweenError::InvalidParameter(format!(
                "window_length must be at least 2, got {}",
                data.window_length
            )));
        }
        if data.train_stride == 0 || data.test_stride == 0 {
            return Err(InbetweenError::InvalidParameter(
                "window strides must be positive".into(),
            ));
        }
        if let Some(facing) = &data.facing {
            if facing.frame >= data.window_length {
                return Err(InbetweenError::InvalidParameter(format!(
                    "facing frame {} outside window of {} frames",
                    facing.frame, data.window_length
                )));
            }
        }
        if data.train_subjects.is_empty() {
            return Err(InbetweenError::EmptySubjects(Split::Train.to_string()));
        }
        if data.test_subjects.is_empty() {
            return Err(InbetweenError::EmptySubjects(Split::Test.to_string()));
        }
        let model = &self.model;
        if model.embedding_dim == 0
            || model.encoder_hidden_dim == 0
            || model.decoder_hidden_dims.0 == 0
            || model.decoder_hidden_dims.1 == 0
            || model.batch_size == 0
        {
            return Err(InbetweenError::InvalidParameter(
                "model widths and batch size must be positive".into(),
            ));
        }
        if self.generation.quat_epsilon <= 0.0 {
            return Err(InbetweenError::InvalidParameter(
                "quat_epsilon must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = InbetweenConfig::default();
        assert_eq!(config.data.window_length, 50);
        assert_eq!(config.data.stride(Split::Train), 10);
        assert_eq!(config.data.stride(Split::Test), 40);
        assert_eq!(config.data.subjects(Split::Test), &["subject5".to_string()]);
        assert_eq!(config.model.embedding_dim, 256);
        assert_eq!(config.generation.condition_marker, 3.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = InbetweenConfig::tiny();
        config.save(&path).unwrap();

        let loaded = InbetweenConfig::from_file(&path).unwrap();
        assert_eq!(loaded.data.window_length, 10);
        assert_eq!(loaded.model.embedding_dim, 16);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "device": { "gpu_id": null } }"#).unwrap();

        let loaded = InbetweenConfig::from_file(&path).unwrap();
        assert_eq!(loaded.data.window_length, 50);
    }

    #[test]
    fn test_validate_rejects_empty_subjects() {
        let mut config = InbetweenConfig::default();
        config.data.test_subjects.clear();
        assert!(matches!(
            config.validate(),
            Err(InbetweenError::EmptySubjects(_))
        ));
    }

    #[test]
    fn test_facing_defaults_and_disables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut json = serde_json::to_value(InbetweenConfig::default()).unwrap();
        let data = json["data"].as_object_mut().unwrap();
        data.remove("facing");
        fs::write(&path, json.to_string()).unwrap();
        let loaded = InbetweenConfig::from_file(&path).unwrap();
        assert_eq!(loaded.data.facing, Some(FacingNormalization::default()));

        json["data"]["facing"] = serde_json::Value::Null;
        fs::write(&path, json.to_string()).unwrap();
        assert_eq!(InbetweenConfig::from_file(&path).unwrap().data.facing, None);

        let mut config = InbetweenConfig::default();
        config.data.window_length = 9;
        assert!(config.validate().is_err());
        config.data.facing = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_stride() {
        let mut config = InbetweenConfig::default();
        config.data.train_stride = 0;
        assert!(config.validate().is_err());
    }
}
