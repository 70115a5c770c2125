//! Attachment blob boundary.
//!
//! Image-backed page backgrounds reference attachments by id. Blob
//! storage itself lives outside the session core; the control block
//! only exposes a handle satisfying this trait.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

/// Blob storage capability referenced from page background meta.
pub trait AttachmentStore: Send + Sync {
    /// Store a blob and return its id.
    fn put(&self, data: Vec<u8>) -> Result<String, AttachmentError>;

    /// Fetch a blob by id.
    fn get(&self, id: &str) -> Result<Vec<u8>, AttachmentError>;
}

#[derive(Debug, Clone)]
pub enum AttachmentError {
    NotFound(String),
    Storage(String),
}

impl std::fmt::Display for AttachmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "no attachment with id {id}"),
            Self::Storage(e) => write!(f, "attachment storage failed: {e}"),
        }
    }
}

impl std::error::Error for AttachmentError {}

/// In-memory store, the default collaborator when none is supplied.
#[derive(Default)]
pub struct MemoryAttachmentStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttachmentStore for MemoryAttachmentStore {
    fn put(&self, data: Vec<u8>) -> Result<String, AttachmentError> {
        let id = Uuid::new_v4().simple().to_string();
        self.blobs
            .lock()
            .expect("attachment lock")
            .insert(id.clone(), data);
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Vec<u8>, AttachmentError> {
        self.blobs
            .lock()
            .expect("attachment lock")
            .get(id)
            .cloned()
            .ok_or_else(|| AttachmentError::NotFound(id.to_string()))
    }
}
