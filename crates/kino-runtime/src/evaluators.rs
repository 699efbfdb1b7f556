//! Reference evaluators over a synthetic byte-stream video format, used by
//! the demo binary and the integration tests.
//!
//! The format: every frame is `width * height` bytes, each byte the frame
//! index modulo 256. Keyframe byte offsets are `position * frame_size`, so a
//! decoder can enter the stream at any keyframe and walk forward.

use kino_core::meta::VideoMetadata;
use kino_core::types::{Device, DeviceType};

use crate::entry::{DecodeArgs, DecodeSampling};
use crate::evaluator::{
    Evaluator, EvaluatorCapabilities, EvaluatorConfig, EvaluatorError, EvaluatorFactory,
};
use crate::memory::Buffer;

pub const FRAME_COLUMN: &str = "frame";

/// Builds the synthetic encoded stream and keyframe index for one video.
pub fn synthetic_video(
    width: i64,
    height: i64,
    frames: i64,
    keyframe_interval: i64,
) -> (VideoMetadata, Vec<u8>) {
    let frame_size = (width * height) as usize;
    let mut data = Vec::with_capacity(frames as usize * frame_size);
    for frame in 0..frames {
        data.extend(std::iter::repeat((frame % 256) as u8).take(frame_size));
    }

    let mut keyframe_positions = Vec::new();
    let mut keyframe_byte_offsets = Vec::new();
    let mut pos = 0;
    while pos < frames {
        keyframe_positions.push(pos);
        keyframe_byte_offsets.push(pos * frame_size as i64);
        pos += keyframe_interval.max(1);
    }

    (
        VideoMetadata {
            width,
            height,
            frames,
            keyframe_positions,
            keyframe_byte_offsets,
        },
        data,
    )
}

/// Decode stage over the byte-stream format.
///
/// Fans each encoded blob out into one row per sampled frame and, on the
/// first blob after a reset, prepends the warmup rows requested by the decode
/// args (bounded by what the blob actually contains).
pub struct ByteStreamDecodeFactory;

impl EvaluatorFactory for ByteStreamDecodeFactory {
    fn capabilities(&self) -> EvaluatorCapabilities {
        EvaluatorCapabilities {
            device_type: DeviceType::Cpu,
            warmup_size: 0,
            can_overlap: true,
        }
    }

    fn output_column_names(&self) -> Vec<String> {
        vec![FRAME_COLUMN.to_string()]
    }

    fn new_evaluator(&self, config: EvaluatorConfig) -> Box<dyn Evaluator> {
        Box::new(ByteStreamDecoder {
            config,
            frame_size: 0,
            fresh: true,
        })
    }
}

struct ByteStreamDecoder {
    config: EvaluatorConfig,
    frame_size: usize,
    fresh: bool,
}

impl ByteStreamDecoder {
    fn emit(
        &self,
        blob: &Buffer,
        args: &DecodeArgs,
        frame: i64,
        out: &mut Vec<Buffer>,
    ) -> Result<(), EvaluatorError> {
        if frame < args.start_keyframe {
            return Err(EvaluatorError::DecodeArgs(format!(
                "frame {frame} precedes decoded range start {}",
                args.start_keyframe
            )));
        }
        let offset = (frame - args.start_keyframe) as usize * self.frame_size;
        let end = offset + self.frame_size;
        if end > blob.len() {
            return Err(EvaluatorError::DecodeArgs(format!(
                "frame {frame} outside decoded range [{}, {})",
                args.start_keyframe, args.end_keyframe
            )));
        }
        let mut row = self
            .config
            .allocator
            .alloc(Device::cpu(), self.frame_size);
        row.as_mut_slice()
            .copy_from_slice(&blob.as_slice()[offset..end]);
        out.push(row);
        Ok(())
    }
}

impl Evaluator for ByteStreamDecoder {
    fn configure(&mut self, metadata: &VideoMetadata) -> Result<(), EvaluatorError> {
        self.frame_size = (metadata.width * metadata.height) as usize;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EvaluatorError> {
        self.fresh = true;
        Ok(())
    }

    fn evaluate(
        &mut self,
        inputs: &[Vec<Buffer>],
        outputs: &mut Vec<Vec<Buffer>>,
    ) -> Result<(), EvaluatorError> {
        if inputs.len() != 2 || inputs[0].len() != inputs[1].len() {
            return Err(EvaluatorError::Failed(
                "decode expects parallel video and video_args columns".to_string(),
            ));
        }
        if self.frame_size == 0 {
            return Err(EvaluatorError::Failed("decoder not configured".to_string()));
        }

        let mut rows = Vec::new();
        for (blob, args_buffer) in inputs[0].iter().zip(inputs[1].iter()) {
            let args = DecodeArgs::from_bytes(args_buffer.as_slice())
                .map_err(|e| EvaluatorError::DecodeArgs(e.to_string()))?;

            let (first, step) = match args.sampling {
                DecodeSampling::All { interval } => (interval.start, 1),
                DecodeSampling::SequenceGather { interval } => (interval.start, 1),
                DecodeSampling::Strided { interval, stride } => (interval.start, stride.max(1)),
                DecodeSampling::Gather { frame } => (frame, 1),
            };

            if std::mem::take(&mut self.fresh) && args.warmup_count > 0 {
                let available = (first - args.start_keyframe) / step;
                let warmup = args.warmup_count.min(available);
                for back in (1..=warmup).rev() {
                    self.emit(blob, &args, first - back * step, &mut rows)?;
                }
            }

            match args.sampling {
                DecodeSampling::All { interval } | DecodeSampling::SequenceGather { interval } => {
                    for frame in interval.start..interval.end {
                        self.emit(blob, &args, frame, &mut rows)?;
                    }
                }
                DecodeSampling::Strided { interval, stride } => {
                    let mut frame = interval.start;
                    while frame < interval.end {
                        self.emit(blob, &args, frame, &mut rows)?;
                        frame += stride.max(1);
                    }
                }
                DecodeSampling::Gather { frame } => {
                    self.emit(blob, &args, frame, &mut rows)?;
                }
            }
        }

        outputs.push(rows);
        Ok(())
    }
}

/// Copies its first input column through on the configured device. Stands in
/// for transform/inference/postprocess stages in demos and tests.
pub struct PassthroughFactory {
    pub column: String,
    pub device_type: DeviceType,
    pub warmup_size: i64,
    pub can_overlap: bool,
}

impl EvaluatorFactory for PassthroughFactory {
    fn capabilities(&self) -> EvaluatorCapabilities {
        EvaluatorCapabilities {
            device_type: self.device_type,
            warmup_size: self.warmup_size,
            can_overlap: self.can_overlap,
        }
    }

    fn output_column_names(&self) -> Vec<String> {
        vec![self.column.clone()]
    }

    fn new_evaluator(&self, config: EvaluatorConfig) -> Box<dyn Evaluator> {
        let device = Device {
            kind: self.device_type,
            id: config.device_id,
        };
        Box::new(PassthroughEvaluator { config, device })
    }
}

struct PassthroughEvaluator {
    config: EvaluatorConfig,
    device: Device,
}

impl Evaluator for PassthroughEvaluator {
    fn configure(&mut self, _metadata: &VideoMetadata) -> Result<(), EvaluatorError> {
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EvaluatorError> {
        Ok(())
    }

    fn evaluate(
        &mut self,
        inputs: &[Vec<Buffer>],
        outputs: &mut Vec<Vec<Buffer>>,
    ) -> Result<(), EvaluatorError> {
        let first = inputs
            .first()
            .ok_or_else(|| EvaluatorError::Failed("passthrough expects one input".to_string()))?;
        let column = first
            .iter()
            .map(|row| self.config.allocator.copy_to(self.device, row))
            .collect();
        outputs.push(column);
        Ok(())
    }
}
