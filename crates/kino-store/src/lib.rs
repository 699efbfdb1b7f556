#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod fs;
pub mod paths;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("invalid storage path: {0}")]
    InvalidPath(String),
    #[error("unsupported storage root: {0}")]
    UnsupportedRoot(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// Random-access read handle; closed on drop.
pub trait ReadFile: Send {
    fn size(&mut self) -> Result<u64, StorageError>;
    fn read_at(&mut self, dst: &mut [u8], pos: u64) -> Result<(), StorageError>;
}

/// Sequential write handle. Nothing is durable until `save` returns;
/// dropping an unsaved handle discards the write.
pub trait WriteFile: Send {
    fn write(&mut self, src: &[u8]) -> Result<(), StorageError>;
    fn save(&mut self) -> Result<(), StorageError>;
}

/// Blob storage seam. Paths are store-relative, `/`-separated.
///
/// Every I/O thread constructs its own instance from a shared
/// [`StorageConfig`] so backends never share state across threads.
pub trait Storage: Send {
    fn open_read(&self, path: &str) -> Result<Box<dyn ReadFile>, StorageError>;
    fn open_write(&self, path: &str) -> Result<Box<dyn WriteFile>, StorageError>;

    fn read_all(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let mut file = self.open_read(path)?;
        let size = file.size()?;
        let mut buf = vec![
            0u8;
            usize::try_from(size)
                .map_err(|_| StorageError::InvalidPath(format!("{path}: file too large")))?
        ];
        file.read_at(&mut buf, 0)?;
        Ok(buf)
    }

    fn write_all(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut file = self.open_write(path)?;
        file.write(bytes)?;
        file.save()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Fs { root: PathBuf },
}

pub fn open_storage(config: &StorageConfig) -> Box<dyn Storage> {
    match config {
        StorageConfig::Fs { root } => Box::new(fs::FsStorage::new(root.clone())),
    }
}

pub fn config_from_root(root: &str) -> Result<StorageConfig, StorageError> {
    let trimmed = root.trim();
    if trimmed.is_empty() {
        return Err(StorageError::UnsupportedRoot(root.to_string()));
    }
    if trimmed.contains("://") {
        return Err(StorageError::UnsupportedRoot(format!(
            "only filesystem roots are supported (got {trimmed:?})"
        )));
    }
    Ok(StorageConfig::Fs {
        root: PathBuf::from(trimmed),
    })
}

/// Bounded exponential backoff for transient write errors.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            attempts: 5,
        }
    }
}

/// Runs `op`, retrying transient errors with exponential backoff. Any other
/// error, or exhaustion of the attempt budget, is returned to the caller.
pub fn retry_transient<T>(
    policy: Backoff,
    mut op: impl FnMut() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let mut delay = policy.base;
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < policy.attempts => {
                attempt += 1;
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err,
                    "transient storage error, backing off");
                std::thread::sleep(delay);
                delay = delay.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_gives_up_after_attempt_budget() {
        let policy = Backoff {
            base: Duration::from_millis(1),
            attempts: 3,
        };
        let mut calls = 0;
        let result: Result<(), StorageError> = retry_transient(policy, || {
            calls += 1;
            Err(StorageError::Transient("still down".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_recovers_from_transient_errors() {
        let policy = Backoff {
            base: Duration::from_millis(1),
            attempts: 5,
        };
        let mut calls = 0;
        let result = retry_transient(policy, || {
            calls += 1;
            if calls < 3 {
                Err(StorageError::Transient("warming up".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.expect("recovers"), 3);
    }

    #[test]
    fn retry_does_not_touch_permanent_errors() {
        let mut calls = 0;
        let result: Result<(), StorageError> = retry_transient(Backoff::default(), || {
            calls += 1;
            Err(StorageError::NotFound("gone".to_string()))
        });
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn config_rejects_url_roots() {
        let err = config_from_root("s3://bucket/prefix").unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedRoot(_)));
    }
}
