//! # Motion In-betweening
//!
//! Recurrent synthesis of the frames between a known start pose and a known
//! end pose of a skeleton, built on candle.
//!
//! ## Features
//! - Windowed extraction of mocap clips with forward kinematics, root
//!   velocities, foot contacts and semantic conditions
//! - Normalisation statistics over global joint positions
//! - State, offset and target encoders sharing one MLP architecture
//! - Sinusoidal time encoding and an LSTM recurrent core
//! - Autoregressive generation loop with explicit per-step state
//! - Per-role safetensors weights, frame export, L2Q/L2P metrics
//!
//! ## Architecture
//!
//! ```text
//! clips ─► WindowExtractor ─► WindowDataset ─► WindowLoader ─► WindowBatch
//!                                   │                              │
//!                        NormalizationStatistics                   ▼
//!                                   │           ┌──── InbetweenModel::generate ────┐
//!                                   │           │  state/offset/target encoders    │
//!                                   │           │  + time encoding + condition     │
//!                                   │           │  ─► LSTM ─► decoder ─► integrate │
//!                                   │           └───────────────┬──────────────────┘
//!                                   ▼                           ▼
//!                                metrics ◄──────────── GeneratedSequence ─► FrameSink
//! ```

// Data preparation
pub mod quat;
pub mod skeleton;
pub mod clip;
pub mod window;
pub mod stats;
pub mod dataset;
pub mod config;
pub mod error;

// Network
pub mod dims;
pub mod plu;
pub mod encoder;
pub mod recurrent;
pub mod decoder;
pub mod model;
pub mod checkpoint;

// Generation and evaluation
pub mod generation;
pub mod export;
pub mod metrics;


pub use skeleton::{ForwardKinematics, RotationRepr, Skeleton};
pub use clip::{ClipLibrary, MotionClip};
pub use window::{ConditionVocabulary, FacingNormalization, MotionWindow, WindowExtractor};
pub use stats::NormalizationStatistics;
pub use dataset::{WindowBatch, WindowDataset, WindowLoader};
pub use config::{
    DataConfig, DeviceConfig, ExportConfig, GenerationConfig, InbetweenConfig, ModelConfig, Split,
};
pub use error::InbetweenError;

pub use dims::{FeatureDims, Features};
pub use plu::Plu;
pub use encoder::{FeatureEncoder, TimeEncoder};
pub use recurrent::RecurrentCore;
pub use decoder::{DecodedDelta, Decoder};
pub use model::{InbetweenModel, ModelSpec, ModelWeights, ModuleRole};
pub use checkpoint::{load_checkpoint, load_weights, save_checkpoint, CheckpointMetadata};

pub use generation::{ConditionTrack, GeneratedSequence, GenerationState, Phase};
pub use export::{ExportedFrame, FrameRecord, FrameSink, JsonlFrameWriter, MemorySink};
pub use metrics::{evaluate, l2p, l2q, EvaluationReport, EvaluationSummary};

/// Result type for in-betweening operations
pub type InbetweenResult<T> = Result<T, InbetweenError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        // Data
        Skeleton,
        ForwardKinematics,
        ClipLibrary,
        WindowDataset,
        WindowLoader,
        WindowBatch,
        InbetweenConfig,
        Split,

        // Network
        InbetweenModel,
        ModelSpec,
        ModuleRole,

        // Generation
        GeneratedSequence,
        FrameSink,
        EvaluationSummary,

        // Result type
        InbetweenResult,
        InbetweenError,
    };
}
