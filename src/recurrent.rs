//! # Recurrent Core
//!
//! A single-layer LSTM that owns its hidden and cell state for one batch of
//! sequences. The state must be created with [`RecurrentCore::reset`] before
//! the first [`RecurrentCore::step`]; stepping an unreset core, or feeding a
//! batch of a different size, is a caller bug and returns
//! [`InbetweenError::ContractViolation`].

use candle_nn::rnn::LSTMState;
use candle_nn::{lstm, LSTMConfig, VarBuilder, LSTM, RNN};

use crate::dims::{FeatureDims, Features, Hidden, RecurrentInput};
use crate::error::InbetweenError;
use crate::InbetweenResult;

#[derive(Debug)]
pub struct RecurrentCore {
    lstm: LSTM,
    state: Option<LSTMState>,
    dims: FeatureDims,
    steps: usize,
}

impl RecurrentCore {
    pub fn new(dims: FeatureDims, vb: VarBuilder) -> InbetweenResult<Self> {
        let lstm = lstm(
            dims.recurrent_input_width(),
            dims.hidden_width(),
            LSTMConfig::default(),
            vb,
        )?;
        Ok(Self {
            lstm,
            state: None,
            dims,
            steps: 0,
        })
    }

    /// Zero hidden and cell state for a new batch of sequences
    pub fn reset(&mut self, batch_size: usize) -> InbetweenResult<()> {
        if batch_size == 0 {
            return Err(InbetweenError::InvalidParameter("batch size must be positive".into()));
        }
        self.state = Some(self.lstm.zero_state(batch_size)?);
        self.steps = 0;
        Ok(())
    }

    /// Batch size of the current state, if any
    pub fn batch_size(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.h().dims()[0])
    }

    /// Steps taken since the last reset
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Advance one timestep and return the new hidden output
    pub fn step(&mut self, input: &Features<RecurrentInput>) -> InbetweenResult<Features<Hidden>> {
        let state = self.state.as_ref().ok_or_else(|| {
            InbetweenError::ContractViolation("recurrent core stepped before reset".into())
        })?;
        let batch = state.h().dims()[0];
        if input.batch_size() != batch {
            return Err(InbetweenError::ContractViolation(format!(
                "recurrent core reset for batch {} but stepped with batch {}",
                batch,
                input.batch_size()
            )));
        }

        let next = self.lstm.step(input.tensor(), state)?;
        let hidden = Features::new(next.h().clone(), &self.dims)?;
        self.state = Some(next);
        self.steps += 1;
        Ok(hidden)
    }
}
