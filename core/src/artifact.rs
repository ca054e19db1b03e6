// conveyor/src/artifact.rs

//! Artifact store client: opaque blobs keyed by run and stage.
//!
//! Both stores address content by SHA-256, so identical outputs from different
//! runs are kept once.

use crate::error::{ConveyorError, ConveyorResult};
use crate::run::model::RunId;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{event, Level};

/// What a run keeps about an artifact. The bytes stay in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
  pub run_id: RunId,
  pub stage_name: String,
  /// Hex-encoded SHA-256 of the content.
  pub digest: String,
  pub size: u64,
}

pub fn content_digest(bytes: &[u8]) -> String {
  hex::encode(Sha256::digest(bytes))
}

#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
  async fn put(&self, run_id: &RunId, stage_name: &str, bytes: Vec<u8>) -> ConveyorResult<ArtifactRef>;

  async fn get(&self, reference: &ArtifactRef) -> ConveyorResult<Vec<u8>>;
}

fn store_error(run_id: &RunId, stage_name: &str, source: impl Into<anyhow::Error>) -> ConveyorError {
  ConveyorError::ArtifactStore {
    run_id: run_id.to_string(),
    stage_name: stage_name.to_string(),
    source: source.into(),
  }
}

#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
  blobs: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl InMemoryArtifactStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of distinct blobs held.
  pub fn blob_count(&self) -> usize {
    self.blobs.read().len()
  }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
  async fn put(&self, run_id: &RunId, stage_name: &str, bytes: Vec<u8>) -> ConveyorResult<ArtifactRef> {
    let digest = content_digest(&bytes);
    let size = bytes.len() as u64;
    self
      .blobs
      .write()
      .entry(digest.clone())
      .or_insert_with(|| Arc::new(bytes));
    Ok(ArtifactRef {
      run_id: run_id.clone(),
      stage_name: stage_name.to_string(),
      digest,
      size,
    })
  }

  async fn get(&self, reference: &ArtifactRef) -> ConveyorResult<Vec<u8>> {
    self
      .blobs
      .read()
      .get(&reference.digest)
      .map(|blob| blob.as_ref().clone())
      .ok_or_else(|| {
        store_error(
          &reference.run_id,
          &reference.stage_name,
          anyhow::anyhow!("no blob with digest {}", reference.digest),
        )
      })
  }
}

/// Blobs under `{root}/{digest[0..2]}/{digest}`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
  root: PathBuf,
}

impl FsArtifactStore {
  pub fn new<P: Into<PathBuf>>(root: P) -> Self {
    Self { root: root.into() }
  }

  fn blob_path(&self, digest: &str) -> PathBuf {
    let shard = digest.get(..2).unwrap_or("00");
    self.root.join(shard).join(digest)
  }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
  async fn put(&self, run_id: &RunId, stage_name: &str, bytes: Vec<u8>) -> ConveyorResult<ArtifactRef> {
    let digest = content_digest(&bytes);
    let size = bytes.len() as u64;
    let path = self.blob_path(&digest);

    if tokio::fs::try_exists(&path)
      .await
      .map_err(|e| store_error(run_id, stage_name, e))?
    {
      event!(Level::DEBUG, %digest, "Artifact already stored, deduplicated.");
    } else {
      if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
          .await
          .map_err(|e| store_error(run_id, stage_name, e))?;
      }
      let tmp = path.with_extension("partial");
      tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| store_error(run_id, stage_name, e))?;
      tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| store_error(run_id, stage_name, e))?;
      event!(Level::DEBUG, %digest, size, "Artifact stored.");
    }

    Ok(ArtifactRef {
      run_id: run_id.clone(),
      stage_name: stage_name.to_string(),
      digest,
      size,
    })
  }

  async fn get(&self, reference: &ArtifactRef) -> ConveyorResult<Vec<u8>> {
    let bytes = tokio::fs::read(self.blob_path(&reference.digest))
      .await
      .map_err(|e| store_error(&reference.run_id, &reference.stage_name, e))?;
    if content_digest(&bytes) != reference.digest {
      return Err(store_error(
        &reference.run_id,
        &reference.stage_name,
        anyhow::anyhow!("content of {} does not match its digest", reference.digest),
      ));
    }
    Ok(bytes)
  }
}
