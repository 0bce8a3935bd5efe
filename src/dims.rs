//! # Feature Widths
//!
//! Every stage of the generator works on `(batch, width)` matrices whose width
//! follows from the skeleton and the embedding size. [`FeatureDims`] derives
//! the widths once; [`Features`] tags a tensor with the stage it belongs to so
//! a state vector can never be handed to the offset encoder.
//!
//! ```text
//! state   = rotations ‖ root velocity ‖ contacts        J·4 + 3 + C
//! offset  = root offset ‖ rotation offset               3 + J·4
//! target  = target rotations                            J·4
//! core in = h_state ‖ h_offset ‖ h_target ‖ condition   3·E + K
//! hidden  = 2 · core in
//! delta   = rotation velocity ‖ root velocity           J·4 + 3
//! ```

use std::marker::PhantomData;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::InbetweenError;
use crate::InbetweenResult;

pub const QUAT_DIM: usize = 4;
pub const ROOT_DIM: usize = 3;

/// Widths of every stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDims {
    pub num_joints: usize,
    pub contact_dim: usize,
    pub condition_dim: usize,
    pub embedding_dim: usize,
}

impl FeatureDims {
    pub fn new(num_joints: usize, contact_dim: usize, condition_dim: usize, embedding_dim: usize) -> Self {
        Self {
            num_joints,
            contact_dim,
            condition_dim,
            embedding_dim,
        }
    }

    pub fn rotation_width(&self) -> usize {
        self.num_joints * QUAT_DIM
    }

    pub fn state_width(&self) -> usize {
        self.rotation_width() + ROOT_DIM + self.contact_dim
    }

    pub fn offset_width(&self) -> usize {
        ROOT_DIM + self.rotation_width()
    }

    pub fn target_width(&self) -> usize {
        self.rotation_width()
    }

    pub fn recurrent_input_width(&self) -> usize {
        3 * self.embedding_dim + self.condition_dim
    }

    pub fn hidden_width(&self) -> usize {
        2 * self.recurrent_input_width()
    }

    pub fn delta_width(&self) -> usize {
        self.rotation_width() + ROOT_DIM
    }
}

/// A stage of the pipeline with a fixed feature width
pub trait FeatureKind {
    const NAME: &'static str;
    fn width(dims: &FeatureDims) -> usize;
}

macro_rules! feature_kind {
    ($(#[$doc:meta])* $name:ident, $label:literal, $width:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl FeatureKind for $name {
            const NAME: &'static str = $label;
            fn width(dims: &FeatureDims) -> usize {
                dims.$width()
            }
        }
    };
}

feature_kind!(
    /// Current pose: rotations, root velocity, contacts
    State, "state", state_width
);
feature_kind!(
    /// Remaining displacement to the target
    Offset, "offset", offset_width
);
feature_kind!(
    /// Target rotations
    Target, "target", target_width
);
feature_kind!(
    /// Output of a feature encoder
    Embedded, "embedding", embedding_width
);
feature_kind!(
    /// Concatenated recurrent-core input for one timestep
    RecurrentInput, "recurrent input", recurrent_input_width
);
feature_kind!(
    /// Recurrent-core output
    Hidden, "hidden", hidden_width
);

impl FeatureDims {
    fn embedding_width(&self) -> usize {
        self.embedding_dim
    }
}

/// A `(batch, width)` tensor whose width has been checked for stage `K`
#[derive(Debug, Clone)]
pub struct Features<K> {
    tensor: Tensor,
    _kind: PhantomData<K>,
}

impl<K: FeatureKind> Features<K> {
    pub fn new(tensor: Tensor, dims: &FeatureDims) -> InbetweenResult<Self> {
        let (_, width) = tensor.dims2()?;
        let expected = K::width(dims);
        if width != expected {
            return Err(InbetweenError::DimensionMismatch {
                context: K::NAME,
                expected,
                got: width,
            });
        }
        Ok(Self {
            tensor,
            _kind: PhantomData,
        })
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn batch_size(&self) -> usize {
        self.tensor.dims()[0]
    }
}
