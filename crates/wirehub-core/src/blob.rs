//! Blob-upload peer port.
//!
//! Uploads bypass the session state machine; the peer only needs the client
//! for credential refreshes during rotation.

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::TransportError;

/// The blob-upload peer.
#[async_trait]
pub trait BlobUploader: Send + Sync {
    /// Upload `data` (of `length` bytes) under `blob_name`.
    async fn upload(
        &self,
        blob_name: &str,
        data: Bytes,
        length: usize,
    ) -> Result<(), TransportError>;

    /// Receive a freshly minted shared access signature.
    fn refresh_credential(&self, sas: &str);
}

/// Placeholder peer used when no uploader was supplied.
pub struct NoBlobUploader;

#[async_trait]
impl BlobUploader for NoBlobUploader {
    async fn upload(
        &self,
        _blob_name: &str,
        _data: Bytes,
        _length: usize,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("upload_to_blob"))
    }

    fn refresh_credential(&self, _sas: &str) {}
}
