//! Reading and writing datasets through the storage seam.

use anyhow::{Context, Result};
use kino_core::meta::{
    canonicalize_database_meta, canonicalize_dataset_descriptor, canonicalize_video_metadata,
    parse_database_meta, parse_dataset_descriptor, parse_video_metadata, DatabaseMeta,
    DatasetDescriptor, VideoMetadata,
};
use kino_store::paths::{
    dataset_descriptor_path, dataset_item_data_path, dataset_item_metadata_path, db_metadata_path,
    validate_name,
};
use kino_store::{Storage, StorageError};

pub struct VideoIngest {
    pub name: String,
    pub metadata: VideoMetadata,
    pub data: Vec<u8>,
}

/// Writes a dataset (descriptor, per-video metadata and payloads) and
/// registers it in the database metadata blob.
pub fn write_dataset(storage: &dyn Storage, dataset_name: &str, videos: &[VideoIngest]) -> Result<()> {
    validate_name(dataset_name)?;
    anyhow::ensure!(!videos.is_empty(), "dataset {dataset_name} has no videos");

    let mut max_width = 0;
    let mut max_height = 0;
    for video in videos {
        validate_name(&video.name)?;
        video
            .metadata
            .validate()
            .with_context(|| format!("metadata of video {}", video.name))?;
        max_width = max_width.max(video.metadata.width);
        max_height = max_height.max(video.metadata.height);
    }

    let descriptor = DatasetDescriptor {
        video_names: videos.iter().map(|v| v.name.clone()).collect(),
        max_width,
        max_height,
    };
    storage.write_all(
        &dataset_descriptor_path(dataset_name),
        &canonicalize_dataset_descriptor(&descriptor),
    )?;

    for video in videos {
        storage.write_all(
            &dataset_item_metadata_path(dataset_name, &video.name),
            &canonicalize_video_metadata(&video.metadata),
        )?;
        storage.write_all(
            &dataset_item_data_path(dataset_name, &video.name),
            &video.data,
        )?;
    }

    let db_path = db_metadata_path();
    let mut db_meta = match storage.read_all(&db_path) {
        Ok(bytes) => parse_database_meta(&bytes)?,
        Err(StorageError::NotFound(_)) => DatabaseMeta::default(),
        Err(err) => return Err(err.into()),
    };
    db_meta.register_dataset(dataset_name);
    storage.write_all(&db_path, &canonicalize_database_meta(&db_meta))?;

    Ok(())
}

/// Loads the dataset descriptor and every video's metadata, in descriptor
/// order. Any storage or parse failure is fatal to the job.
pub fn read_dataset(
    storage: &dyn Storage,
    dataset_name: &str,
) -> Result<(DatasetDescriptor, Vec<VideoMetadata>)> {
    let descriptor_bytes = storage
        .read_all(&dataset_descriptor_path(dataset_name))
        .with_context(|| format!("read descriptor of dataset {dataset_name}"))?;
    let descriptor = parse_dataset_descriptor(&descriptor_bytes)?;

    let mut videos = Vec::with_capacity(descriptor.video_names.len());
    for name in &descriptor.video_names {
        let bytes = storage
            .read_all(&dataset_item_metadata_path(dataset_name, name))
            .with_context(|| format!("read metadata of video {name}"))?;
        let metadata =
            parse_video_metadata(&bytes).with_context(|| format!("parse metadata of video {name}"))?;
        videos.push(metadata);
    }

    Ok((descriptor, videos))
}
