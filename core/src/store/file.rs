// conveyor/src/store/file.rs

//! JSON-file store. Layout under the root directory:
//!
//! - `runs/{run_id}.json`
//! - `approvals/{run_id}/{stage}.json`
//!
//! Every write goes to a temporary file in the same directory, is synced, and is then
//! renamed over the target, so a reader never sees a torn record.

use crate::approval::ApprovalRequest;
use crate::error::{ConveyorError, ConveyorResult};
use crate::run::model::{Run, RunId};
use crate::store::RunStore;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{event, Level};

#[derive(Debug, Clone)]
pub struct FileRunStore {
  root: PathBuf,
}

impl FileRunStore {
  /// Creates the directory layout if needed.
  pub async fn open<P: Into<PathBuf>>(root: P) -> ConveyorResult<Self> {
    let root = root.into();
    for dir in [root.join("runs"), root.join("approvals")] {
      fs::create_dir_all(&dir)
        .await
        .map_err(|e| ConveyorError::persistence(format!("creating {}", dir.display()), e))?;
    }
    event!(Level::DEBUG, root = %root.display(), "File run store opened.");
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn run_path(&self, run_id: &RunId) -> PathBuf {
    self
      .root
      .join("runs")
      .join(format!("{}.json", encode_component(run_id.as_str())))
  }

  fn approval_path(&self, run_id: &RunId, stage_name: &str) -> PathBuf {
    self
      .root
      .join("approvals")
      .join(encode_component(run_id.as_str()))
      .join(format!("{}.json", encode_component(stage_name)))
  }
}

/// Keeps `[A-Za-z0-9_-]` and percent-encodes every other byte, so names map to
/// distinct, portable file names.
fn encode_component(raw: &str) -> String {
  let mut out = String::with_capacity(raw.len());
  for byte in raw.bytes() {
    if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
      out.push(byte as char);
    } else {
      out.push_str(&format!("%{:02X}", byte));
    }
  }
  out
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> ConveyorResult<()> {
  let operation = || format!("writing {}", path.display());
  let bytes = serde_json::to_vec_pretty(value).map_err(|e| ConveyorError::persistence(operation(), e))?;

  let parent = path
    .parent()
    .ok_or_else(|| ConveyorError::Internal(format!("{} has no parent directory", path.display())))?;
  fs::create_dir_all(parent)
    .await
    .map_err(|e| ConveyorError::persistence(operation(), e))?;

  let tmp = path.with_extension("json.tmp");
  let mut file = fs::File::create(&tmp)
    .await
    .map_err(|e| ConveyorError::persistence(operation(), e))?;
  file
    .write_all(&bytes)
    .await
    .map_err(|e| ConveyorError::persistence(operation(), e))?;
  file
    .sync_all()
    .await
    .map_err(|e| ConveyorError::persistence(operation(), e))?;
  drop(file);

  fs::rename(&tmp, path)
    .await
    .map_err(|e| ConveyorError::persistence(operation(), e))?;
  Ok(())
}

async fn read_optional<T: DeserializeOwned>(path: &Path) -> ConveyorResult<Option<T>> {
  match fs::read(path).await {
    Ok(bytes) => serde_json::from_slice(&bytes)
      .map(Some)
      .map_err(|e| ConveyorError::persistence(format!("parsing {}", path.display()), e)),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(ConveyorError::persistence(format!("reading {}", path.display()), e)),
  }
}

#[async_trait]
impl RunStore for FileRunStore {
  async fn save_run(&self, run: &Run) -> ConveyorResult<()> {
    write_atomic(&self.run_path(&run.run_id), run).await?;
    event!(Level::TRACE, run_id = %run.run_id, revision = run.revision, status = %run.status, "Run persisted.");
    Ok(())
  }

  async fn load_run(&self, run_id: &RunId) -> ConveyorResult<Option<Run>> {
    read_optional(&self.run_path(run_id)).await
  }

  async fn list_runs(&self) -> ConveyorResult<Vec<Run>> {
    let dir = self.root.join("runs");
    let mut entries = fs::read_dir(&dir)
      .await
      .map_err(|e| ConveyorError::persistence(format!("listing {}", dir.display()), e))?;

    let mut runs = Vec::new();
    while let Some(entry) = entries
      .next_entry()
      .await
      .map_err(|e| ConveyorError::persistence(format!("listing {}", dir.display()), e))?
    {
      let path = entry.path();
      if path.extension().and_then(|e| e.to_str()) != Some("json") {
        continue;
      }
      match read_optional::<Run>(&path).await {
        Ok(Some(run)) => runs.push(run),
        Ok(None) => {}
        Err(e) => {
          event!(Level::WARN, path = %path.display(), error = %e, "Skipping unreadable run record.");
        }
      }
    }
    runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.run_id.cmp(&b.run_id)));
    Ok(runs)
  }

  async fn save_approval(&self, request: &ApprovalRequest) -> ConveyorResult<()> {
    write_atomic(&self.approval_path(&request.run_id, &request.stage_name), request).await
  }

  async fn load_approval(&self, run_id: &RunId, stage_name: &str) -> ConveyorResult<Option<ApprovalRequest>> {
    read_optional(&self.approval_path(run_id, stage_name)).await
  }
}
