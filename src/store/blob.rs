//! Blob store contract for message attachments
//!
//! The sync layer only needs a URL and a size back from an upload; the URL is
//! treated as opaque everywhere else.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBlob {
    pub url: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<UploadedBlob>;
}

/// Keeps uploads in memory under `mem://blobs/<id>` URLs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, (String, Vec<u8>)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content type and bytes stored under `url`.
    pub fn fetch(&self, url: &str) -> Option<(String, Vec<u8>)> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<UploadedBlob> {
        if bytes.is_empty() {
            return Err(SyncError::validation("refusing to upload an empty blob"));
        }
        let url = format!("mem://blobs/{}", Uuid::new_v4().simple());
        let size_bytes = bytes.len() as u64;
        tracing::debug!("Stored {} byte blob ({}) at {}", size_bytes, content_type, url);
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.clone(), (content_type.to_string(), bytes));
        Ok(UploadedBlob { url, size_bytes })
    }
}
