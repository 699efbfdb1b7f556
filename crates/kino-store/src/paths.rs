//! Store-relative layout of everything the pipeline persists.

use crate::StorageError;

pub fn dataset_descriptor_path(dataset: &str) -> String {
    format!("datasets/{dataset}/descriptor")
}

pub fn dataset_item_metadata_path(dataset: &str, video: &str) -> String {
    format!("datasets/{dataset}/items/{video}/metadata")
}

pub fn dataset_item_data_path(dataset: &str, video: &str) -> String {
    format!("datasets/{dataset}/items/{video}/data")
}

pub fn job_descriptor_path(job: &str) -> String {
    format!("jobs/{job}/descriptor")
}

pub fn job_item_output_path(job: &str, video: &str, column: &str, work_item_index: usize) -> String {
    format!("jobs/{job}/{video}/{column}/{work_item_index}")
}

pub fn job_profile_path(job: &str, rank: usize) -> String {
    format!("jobs/{job}/profile_{rank}")
}

pub fn db_metadata_path() -> String {
    "db_metadata".to_string()
}

/// Dataset, job, video and column names become path components; reject
/// anything that could escape the store root.
pub fn validate_name(name: &str) -> Result<(), StorageError> {
    let ok = !name.trim().is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..");
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidPath(name.to_string()))
    }
}
