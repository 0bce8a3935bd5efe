//! # Frame Export
//!
//! The generator hands every predicted frame to a [`FrameSink`]. Sinks only
//! receive data; rendering or animation happens downstream.
//!
//! [`JsonlFrameWriter`] writes one JSON object per line for a single batch
//! element:
//!
//! ```text
//! {"sequence_id":3,"frame":1,"predicted":[[x,y,z],...],"ground_truth":[[x,y,z],...]}
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::{IndexOp, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::InbetweenError;
use crate::InbetweenResult;

/// Global positions of one generated frame for a whole batch
#[derive(Debug, Clone, Copy)]
pub struct FrameRecord<'a> {
    /// Frame index inside the window; the seed frame is 0
    pub frame: usize,
    pub sequence_ids: &'a [usize],
    /// `[batch, joints, 3]`
    pub predicted: &'a Tensor,
    /// `[batch, joints, 3]`, when known
    pub ground_truth: Option<&'a Tensor>,
}

/// One batch element of a [`FrameRecord`], on the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedFrame {
    pub sequence_id: usize,
    pub frame: usize,
    pub predicted: Vec<[f32; 3]>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ground_truth: Option<Vec<[f32; 3]>>,
}

fn joint_rows(positions: &Tensor, element: usize) -> InbetweenResult<Vec<[f32; 3]>> {
    let rows = positions.i(element)?.to_vec2::<f32>()?;
    rows.into_iter()
        .map(|row| {
            <[f32; 3]>::try_from(row.as_slice()).map_err(|_| InbetweenError::DimensionMismatch {
                context: "exported joint position",
                expected: 3,
                got: row.len(),
            })
        })
        .collect()
}

impl FrameRecord<'_> {
    pub fn batch_size(&self) -> usize {
        self.sequence_ids.len()
    }

    pub fn element(&self, index: usize) -> InbetweenResult<ExportedFrame> {
        let sequence_id = *self.sequence_ids.get(index).ok_or_else(|| {
            InbetweenError::InvalidParameter(format!(
                "batch element {} out of range for batch of {}",
                index,
                self.batch_size()
            ))
        })?;
        Ok(ExportedFrame {
            sequence_id,
            frame: self.frame,
            predicted: joint_rows(self.predicted, index)?,
            ground_truth: self
                .ground_truth
                .map(|gt| joint_rows(gt, index))
                .transpose()?,
        })
    }
}

/// Consumer of generated frames
pub trait FrameSink {
    fn consume(&mut self, record: &FrameRecord<'_>) -> InbetweenResult<()>;

    /// Called once after the last frame of a batch
    fn finish(&mut self) -> InbetweenResult<()> {
        Ok(())
    }
}

/// Writes one batch element as JSON lines
pub struct JsonlFrameWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    batch_index: usize,
    frames_written: usize,
}

impl JsonlFrameWriter {
    pub fn create(path: impl AsRef<Path>, batch_index: usize) -> InbetweenResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| InbetweenError::Io(format!("Failed to create {:?}: {}", parent, e)))?;
        }
        let file = File::create(&path)
            .map_err(|e| InbetweenError::Io(format!("Failed to create {:?}: {}", path, e)))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            batch_index,
            frames_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }
}

impl FrameSink for JsonlFrameWriter {
    fn consume(&mut self, record: &FrameRecord<'_>) -> InbetweenResult<()> {
        let frame = record.element(self.batch_index)?;
        serde_json::to_writer(&mut self.writer, &frame)?;
        self.writer.write_all(b"\n")?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> InbetweenResult<()> {
        self.writer.flush()?;
        log::debug!("Wrote {} frames to {:?}", self.frames_written, self.path);
        Ok(())
    }
}

/// Keeps every batch element of every frame
#[derive(Debug, Default)]
pub struct MemorySink {
    pub frames: Vec<ExportedFrame>,
    pub finished: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames of one sequence in arrival order
    pub fn sequence(&self, sequence_id: usize) -> Vec<&ExportedFrame> {
        self.frames.iter().filter(|f| f.sequence_id == sequence_id).collect()
    }
}

impl FrameSink for MemorySink {
    fn consume(&mut self, record: &FrameRecord<'_>) -> InbetweenResult<()> {
        for i in 0..record.batch_size() {
            self.frames.push(record.element(i)?);
        }
        Ok(())
    }

    fn finish(&mut self) -> InbetweenResult<()> {
        self.finished += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use tempfile::TempDir;

    fn positions(offset: f32) -> Tensor {
        let data: Vec<f32> = (0..12).map(|v| v as f32 + offset).collect();
        Tensor::from_vec(data, (2, 2, 3), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_memory_sink_splits_batch() {
        let predicted = positions(0.0);
        let ids = [4, 9];
        let record = FrameRecord {
            frame: 1,
            sequence_ids: &ids,
            predicted: &predicted,
            ground_truth: None,
        };
        let mut sink = MemorySink::new();
        sink.consume(&record).unwrap();

        assert_eq!(sink.frames.len(), 2);
        let second = sink.sequence(9);
        assert_eq!(second[0].predicted, vec![[6.0, 7.0, 8.0], [9.0, 10.0, 11.0]]);
        assert!(second[0].ground_truth.is_none());
    }

    #[test]
    fn test_jsonl_writer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("frames.jsonl");
        let predicted = positions(0.0);
        let truth = positions(100.0);
        let ids = [0, 1];

        let mut writer = JsonlFrameWriter::create(&path, 1).unwrap();
        for frame in 1..4 {
            let record = FrameRecord {
                frame,
                sequence_ids: &ids,
                predicted: &predicted,
                ground_truth: Some(&truth),
            };
            writer.consume(&record).unwrap();
        }
        writer.finish().unwrap();
        assert_eq!(writer.frames_written(), 3);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<ExportedFrame> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2].frame, 3);
        assert_eq!(lines[0].sequence_id, 1);
        assert_eq!(lines[0].ground_truth.as_ref().unwrap()[0], [106.0, 107.0, 108.0]);
    }

    #[test]
    fn test_out_of_range_element() {
        let predicted = positions(0.0);
        let ids = [0, 1];
        let record = FrameRecord {
            frame: 1,
            sequence_ids: &ids,
            predicted: &predicted,
            ground_truth: None,
        };
        assert!(record.element(2).is_err());
    }
}
