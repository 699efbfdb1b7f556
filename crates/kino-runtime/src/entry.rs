use kino_core::types::{Device, Interval};
use serde::{Deserialize, Serialize};

use crate::memory::{Allocator, Buffer};

pub const ENCODED_VIDEO_COLUMN: &str = "video";
pub const DECODE_ARGS_COLUMN: &str = "video_args";

/// One unit of data flowing between pipeline stages.
///
/// Columns are parallel: every column holds one buffer per row. Pushing an
/// entry through a queue transfers ownership of every buffer in it; whoever
/// drops rows must release them through the allocator.
#[derive(Debug)]
pub struct EvalEntry {
    pub work_item_index: usize,
    pub column_names: Vec<String>,
    pub columns: Vec<Vec<Buffer>>,
    pub device: Device,
    /// Set by the load stage: the first evaluator fans one encoded blob out
    /// into many decoded rows, so its row-count validation is relaxed.
    pub video_decode: bool,
}

impl EvalEntry {
    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn release_all(self, allocator: &Allocator) {
        for column in self.columns {
            for buffer in column {
                allocator.release(buffer);
            }
        }
    }
}

/// Per-interval sampling directions for the decode evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeSampling {
    All { interval: Interval },
    Strided { interval: Interval, stride: i64 },
    Gather { frame: i64 },
    SequenceGather { interval: Interval },
}

/// Owned decode-argument record, carried as serialized bytes in the
/// `video_args` column parallel to the encoded blobs.
///
/// `warmup_count` is the number of warmup rows the decoder should emit ahead
/// of the requested range after a reset; the load stage caps it at the rows
/// preceding the item so the chain's warmup trim removes exactly those rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeArgs {
    pub warmup_count: i64,
    pub sampling: DecodeSampling,
    pub start_keyframe: i64,
    pub end_keyframe: i64,
}

impl DecodeArgs {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
