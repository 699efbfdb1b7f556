//! Save stage: writes one output file per (work item, column) and retires
//! the item so the driver's intake gate opens back up.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use kino_core::types::WorkItem;
use kino_observe::metrics::Counter;
use kino_observe::profiler::Profiler;
use kino_store::paths::job_item_output_path;
use kino_store::{open_storage, retry_transient, Backoff, Storage, StorageConfig};
use tracing::info;

use crate::entry::EvalEntry;
use crate::memory::Allocator;
use crate::queue::WorkQueue;

pub struct SaveWorkerArgs {
    pub job_name: String,
    pub video_names: Arc<Vec<String>>,
    pub work_items: Arc<Vec<WorkItem>>,
    pub column_names: Vec<String>,

    pub rank: usize,
    pub worker_id: usize,
    pub storage: StorageConfig,
    pub allocator: Arc<Allocator>,
    pub profiler: Profiler,

    pub input: WorkQueue<EvalEntry>,
    pub retired_items: Arc<Counter>,
}

pub fn run_save_worker(args: SaveWorkerArgs) -> Result<()> {
    let setup_start = Instant::now();
    let storage = open_storage(&args.storage);
    args.profiler.add_interval("setup", setup_start, Instant::now());

    loop {
        let idle_start = Instant::now();
        let Some(entry) = args.input.pop()? else {
            break;
        };
        args.profiler.add_interval("idle", idle_start, Instant::now());

        info!(
            rank = args.rank,
            worker = args.worker_id,
            item = entry.work_item_index,
            "save: processing item"
        );

        let work_start = Instant::now();

        let work_item = args
            .work_items
            .get(entry.work_item_index)
            .context("save entry references an unknown work item")?;
        let video_name = &args.video_names[work_item.video_index];

        ensure!(
            entry.columns.len() == args.column_names.len(),
            "save entry has {} columns, job declares {}",
            entry.columns.len(),
            args.column_names.len()
        );

        let num_rows = entry.rows();
        for (column_name, column) in args.column_names.iter().zip(entry.columns) {
            ensure!(
                column.len() == num_rows,
                "column {column_name} has {} rows, expected {num_rows}",
                column.len()
            );

            let path = job_item_output_path(
                &args.job_name,
                video_name,
                column_name,
                entry.work_item_index,
            );

            let io_start = Instant::now();
            let mut file = retry_transient(Backoff::default(), || storage.open_write(&path))
                .with_context(|| format!("open output {path}"))?;

            // Size table first so readers can index rows without a footer.
            for buffer in &column {
                file.write(&(buffer.len() as i64).to_le_bytes())
                    .with_context(|| format!("write size table of {path}"))?;
            }
            for buffer in &column {
                file.write(buffer.as_slice())
                    .with_context(|| format!("write payload of {path}"))?;
            }
            file.save().with_context(|| format!("save {path}"))?;
            args.profiler.add_interval("io", io_start, Instant::now());

            for buffer in column {
                args.allocator.release(buffer);
            }
        }

        info!(
            rank = args.rank,
            worker = args.worker_id,
            item = entry.work_item_index,
            "save: finished item"
        );

        args.profiler.add_interval("task", work_start, Instant::now());

        args.retired_items.inc();
    }

    info!(
        rank = args.rank,
        worker = args.worker_id,
        "save: worker finished"
    );
    Ok(())
}

/// Reads one output file back into rows: the inverse of the save format.
///
/// The row count is not stored; it is the unique `n` at which the `n`-entry
/// size table plus the payload bytes it describes account for the whole file.
pub fn read_output_rows(
    storage: &dyn Storage,
    job: &str,
    video: &str,
    column: &str,
    work_item_index: usize,
) -> Result<Vec<Vec<u8>>> {
    let path = job_item_output_path(job, video, column, work_item_index);
    let bytes = storage
        .read_all(&path)
        .with_context(|| format!("read output {path}"))?;

    let mut sizes: Vec<usize> = Vec::new();
    let mut payload_total: usize = 0;
    loop {
        let table_len = 8 * sizes.len();
        if table_len + payload_total == bytes.len() {
            break;
        }
        let raw = bytes
            .get(table_len..table_len + 8)
            .with_context(|| format!("truncated size table in {path}"))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        let size = i64::from_le_bytes(buf);
        ensure!(size >= 0, "negative row size in {path}");
        sizes.push(size as usize);
        payload_total += size as usize;
    }

    let mut rows = Vec::with_capacity(sizes.len());
    let mut offset = 8 * sizes.len();
    for size in sizes {
        let row = bytes
            .get(offset..offset + size)
            .with_context(|| format!("truncated payload in {path}"))?;
        rows.push(row.to_vec());
        offset += size;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_row_count_is_recoverable() {
        // Size table [3, 0, 2] followed by "abc" and "xy".
        let mut bytes = Vec::new();
        for size in [3i64, 0, 2] {
            bytes.extend_from_slice(&size.to_le_bytes());
        }
        bytes.extend_from_slice(b"abcxy");

        struct OneFile(Vec<u8>);
        impl Storage for OneFile {
            fn open_read(
                &self,
                _path: &str,
            ) -> std::result::Result<Box<dyn kino_store::ReadFile>, kino_store::StorageError>
            {
                struct R(Vec<u8>);
                impl kino_store::ReadFile for R {
                    fn size(&mut self) -> std::result::Result<u64, kino_store::StorageError> {
                        Ok(self.0.len() as u64)
                    }
                    fn read_at(
                        &mut self,
                        dst: &mut [u8],
                        pos: u64,
                    ) -> std::result::Result<(), kino_store::StorageError> {
                        let pos = pos as usize;
                        dst.copy_from_slice(&self.0[pos..pos + dst.len()]);
                        Ok(())
                    }
                }
                Ok(Box::new(R(self.0.clone())))
            }

            fn open_write(
                &self,
                path: &str,
            ) -> std::result::Result<Box<dyn kino_store::WriteFile>, kino_store::StorageError>
            {
                Err(kino_store::StorageError::InvalidPath(path.to_string()))
            }
        }

        let rows = read_output_rows(&OneFile(bytes), "j", "v", "c", 0).expect("rows");
        assert_eq!(rows, vec![b"abc".to_vec(), Vec::new(), b"xy".to_vec()]);
    }
}
