//! Per-worker interval profiling and the per-node binary profile blob.
//!
//! Workers record `(label, start, end)` intervals against a shared base
//! instant; the driver collects one [`WorkerProfile`] per worker and writes a
//! [`NodeProfile`] blob at job end for offline analysis.

use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfiledInterval {
    pub label: &'static str,
    pub start_ns: u64,
    pub end_ns: u64,
}

/// Cheap-to-clone interval recorder handed to one worker (and its
/// evaluators).
#[derive(Debug, Clone)]
pub struct Profiler {
    base: Instant,
    intervals: Arc<Mutex<Vec<ProfiledInterval>>>,
}

impl Profiler {
    pub fn new(base: Instant) -> Self {
        Self {
            base,
            intervals: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add_interval(&self, label: &'static str, start: Instant, end: Instant) {
        let interval = ProfiledInterval {
            label,
            start_ns: self.offset_ns(start),
            end_ns: self.offset_ns(end),
        };
        if let Ok(mut guard) = self.intervals.lock() {
            guard.push(interval);
        }
    }

    pub fn snapshot(&self) -> Vec<ProfiledInterval> {
        self.intervals
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn offset_ns(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.base)
            .as_nanos()
            .min(u64::MAX as u128) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProfile {
    /// Worker category: `load`, `eval` or `save`.
    pub category: String,
    /// Sub-tag within the category (`fg<group>` for eval workers).
    pub tag: String,
    pub worker_id: u64,
    pub intervals: Vec<OwnedInterval>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedInterval {
    pub label: String,
    pub start_ns: u64,
    pub end_ns: u64,
}

impl From<ProfiledInterval> for OwnedInterval {
    fn from(i: ProfiledInterval) -> Self {
        Self {
            label: i.label.to_string(),
            start_ns: i.start_ns,
            end_ns: i.end_ns,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeProfile {
    pub rank: u64,
    pub start_unix_ms: u64,
    pub end_unix_ms: u64,
    pub workers: Vec<WorkerProfile>,
}

pub const PROFILE_FORMAT_VERSION: u32 = 1;

#[derive(Debug)]
pub enum ProfileDecodeError {
    Truncated,
    BadVersion(u32),
    BadString,
}

impl std::fmt::Display for ProfileDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileDecodeError::Truncated => write!(f, "profile blob truncated"),
            ProfileDecodeError::BadVersion(v) => write!(f, "unsupported profile version {v}"),
            ProfileDecodeError::BadString => write!(f, "profile string is not utf-8"),
        }
    }
}

impl std::error::Error for ProfileDecodeError {}

pub fn encode_node_profile(profile: &NodeProfile) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, PROFILE_FORMAT_VERSION);
    put_u64(&mut out, profile.rank);
    put_u64(&mut out, profile.start_unix_ms);
    put_u64(&mut out, profile.end_unix_ms);
    put_u32(&mut out, profile.workers.len() as u32);
    for worker in &profile.workers {
        put_str(&mut out, &worker.category);
        put_str(&mut out, &worker.tag);
        put_u64(&mut out, worker.worker_id);
        put_u32(&mut out, worker.intervals.len() as u32);
        for interval in &worker.intervals {
            put_str(&mut out, &interval.label);
            put_u64(&mut out, interval.start_ns);
            put_u64(&mut out, interval.end_ns);
        }
    }
    out
}

pub fn decode_node_profile(bytes: &[u8]) -> Result<NodeProfile, ProfileDecodeError> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let version = cursor.u32()?;
    if version != PROFILE_FORMAT_VERSION {
        return Err(ProfileDecodeError::BadVersion(version));
    }
    let rank = cursor.u64()?;
    let start_unix_ms = cursor.u64()?;
    let end_unix_ms = cursor.u64()?;
    let worker_count = cursor.u32()?;
    let mut workers = Vec::with_capacity(worker_count as usize);
    for _ in 0..worker_count {
        let category = cursor.string()?;
        let tag = cursor.string()?;
        let worker_id = cursor.u64()?;
        let interval_count = cursor.u32()?;
        let mut intervals = Vec::with_capacity(interval_count as usize);
        for _ in 0..interval_count {
            let label = cursor.string()?;
            let start_ns = cursor.u64()?;
            let end_ns = cursor.u64()?;
            intervals.push(OwnedInterval {
                label,
                start_ns,
                end_ns,
            });
        }
        workers.push(WorkerProfile {
            category,
            tag,
            worker_id,
            intervals,
        });
    }
    Ok(NodeProfile {
        rank,
        start_unix_ms,
        end_unix_ms,
        workers,
    })
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    put_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], ProfileDecodeError> {
        if self.pos + n > self.bytes.len() {
            return Err(ProfileDecodeError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, ProfileDecodeError> {
        let raw = self.take(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(raw);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, ProfileDecodeError> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_le_bytes(buf))
    }

    fn string(&mut self) -> Result<String, ProfileDecodeError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProfileDecodeError::BadString)
    }
}
