// conveyor/src/executor/shell.rs

//! Runs stage commands through `sh -c`, one after another, in a scratch directory.
//!
//! Each command sees:
//!
//! | variable            | value                                                  |
//! |---------------------|--------------------------------------------------------|
//! | `CONVEYOR_RUN_ID`   | run id                                                 |
//! | `CONVEYOR_PIPELINE` | pipeline name                                          |
//! | `CONVEYOR_BRANCH`   | trigger branch                                         |
//! | `CONVEYOR_COMMIT`   | trigger commit                                         |
//! | `CONVEYOR_STAGE`    | stage name                                             |
//! | `CONVEYOR_ATTEMPT`  | 1-based attempt number                                 |
//! | `CONVEYOR_INPUT`    | file holding the input artifact (only if one is wired) |
//! | `CONVEYOR_OUTPUT`   | file to write the output artifact to                   |

use crate::artifact::ArtifactStore;
use crate::error::{ConveyorError, ConveyorResult};
use crate::executor::{ExecutionContext, FailureReason, StageExecutor, StageOutcome};
use crate::pipeline::StageSpec;
use crate::run::model::Diagnostic;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

const INPUT_FILE: &str = "input.artifact";
const OUTPUT_FILE: &str = "output.artifact";

pub struct ShellStageExecutor {
  artifacts: Arc<dyn ArtifactStore>,
  work_root: PathBuf,
  shell: String,
  extra_env: Vec<(String, String)>,
}

impl ShellStageExecutor {
  pub fn new<P: Into<PathBuf>>(artifacts: Arc<dyn ArtifactStore>, work_root: P) -> Self {
    Self {
      artifacts,
      work_root: work_root.into(),
      shell: "sh".to_string(),
      extra_env: Vec::new(),
    }
  }

  /// Adds a variable to every command's environment.
  pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
    self.extra_env.push((key.into(), value.into()));
    self
  }

  pub fn with_shell<S: Into<String>>(mut self, shell: S) -> Self {
    self.shell = shell.into();
    self
  }

  fn attempt_dir(&self, ctx: &ExecutionContext, stage: &StageSpec) -> PathBuf {
    self
      .work_root
      .join(ctx.run_id.as_str())
      .join(format!("{}-{}", sanitize(&stage.name), ctx.attempt))
  }

  fn command(&self, script: &str, dir: &Path, ctx: &ExecutionContext, stage: &StageSpec, input: Option<&Path>) -> Command {
    let mut cmd = Command::new(&self.shell);
    cmd
      .arg("-c")
      .arg(script)
      .current_dir(dir)
      .env("CONVEYOR_RUN_ID", ctx.run_id.as_str())
      .env("CONVEYOR_PIPELINE", &ctx.definition.name)
      .env("CONVEYOR_BRANCH", &ctx.trigger.branch)
      .env("CONVEYOR_COMMIT", &ctx.trigger.commit)
      .env("CONVEYOR_STAGE", &stage.name)
      .env("CONVEYOR_ATTEMPT", ctx.attempt.to_string())
      .env("CONVEYOR_OUTPUT", dir.join(OUTPUT_FILE))
      .envs(self.extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    if let Some(input) = input {
      cmd.env("CONVEYOR_INPUT", input);
    }
    cmd
  }

  async fn run_commands(
    &self,
    dir: &Path,
    ctx: &ExecutionContext,
    stage: &StageSpec,
    cancel: &CancellationToken,
  ) -> ConveyorResult<StageOutcome> {
    let input = match &ctx.input {
      Some(reference) => {
        let bytes = self.artifacts.get(reference).await?;
        let path = dir.join(INPUT_FILE);
        tokio::fs::write(&path, bytes).await.map_err(|e| work_dir_error(dir, e))?;
        Some(path)
      }
      None => None,
    };

    for script in &stage.commands {
      if cancel.is_cancelled() {
        return Ok(StageOutcome::cancelled());
      }
      let child = self
        .command(script, dir, ctx, stage, input.as_deref())
        .spawn()
        .map_err(|e| ConveyorError::External {
          source: anyhow::Error::new(e).context(format!("spawning `{}`", script)),
        })?;
      event!(Level::DEBUG, command = %script, "Command spawned.");

      let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|e| ConveyorError::External {
          source: anyhow::Error::new(e).context(format!("waiting on `{}`", script)),
        })?,
        _ = cancel.cancelled() => {
          // Dropping the wait future drops the child, which kills it.
          event!(Level::INFO, command = %script, "Command cancelled.");
          return Ok(StageOutcome::cancelled());
        }
      };

      if !output.status.success() {
        let exit_code = output.status.code();
        event!(Level::WARN, command = %script, ?exit_code, "Command failed.");
        let diagnostic = Diagnostic::new(format!("`{}` exited with {}", script, output.status))
          .with_exit_code(exit_code)
          .with_stderr(&output.stderr);
        return Ok(StageOutcome::Failure {
          reason: FailureReason::CommandFailed {
            command: script.clone(),
            exit_code,
          },
          diagnostic: Some(diagnostic),
        });
      }
    }

    if !stage.produces_artifact {
      return Ok(StageOutcome::success());
    }

    let output_path = dir.join(OUTPUT_FILE);
    match tokio::fs::read(&output_path).await {
      Ok(bytes) => {
        let artifact = self.artifacts.put(&ctx.run_id, &stage.name, bytes).await?;
        event!(Level::DEBUG, digest = %artifact.digest, size = artifact.size, "Stage artifact stored.");
        Ok(StageOutcome::Success {
          artifact: Some(artifact),
        })
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StageOutcome::Failure {
        reason: FailureReason::MissingArtifact,
        diagnostic: Some(Diagnostic::new("stage declares an artifact but wrote nothing to $CONVEYOR_OUTPUT")),
      }),
      Err(e) => Err(work_dir_error(dir, e)),
    }
  }
}

#[async_trait]
impl StageExecutor for ShellStageExecutor {
  #[instrument(name = "ShellStageExecutor::execute", skip_all, fields(run_id = %ctx.run_id, stage = %stage.name, attempt = ctx.attempt), err(Display))]
  async fn execute(
    &self,
    ctx: &ExecutionContext,
    stage: &StageSpec,
    cancel: CancellationToken,
  ) -> ConveyorResult<StageOutcome> {
    let dir = self.attempt_dir(ctx, stage);
    // A crashed attempt with the same number may have left files behind.
    if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
      if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
        event!(Level::DEBUG, dir = %dir.display(), error = %e, "Could not clear leftover attempt directory.");
      }
    }
    tokio::fs::create_dir_all(&dir).await.map_err(|e| work_dir_error(&dir, e))?;

    let outcome = self.run_commands(&dir, ctx, stage, &cancel).await;

    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
      event!(Level::DEBUG, dir = %dir.display(), error = %e, "Could not remove attempt directory.");
    }
    outcome
  }
}

fn work_dir_error(dir: &Path, source: std::io::Error) -> ConveyorError {
  ConveyorError::External {
    source: anyhow::Error::new(source).context(format!("work directory {}", dir.display())),
  }
}

fn sanitize(name: &str) -> String {
  name
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::InMemoryArtifactStore;
  use crate::pipeline::{DefinitionRef, EventType, TriggerRef};
  use crate::run::model::RunId;
  use std::time::Duration;

  fn ctx(attempt: u32) -> ExecutionContext {
    ExecutionContext {
      run_id: RunId::from("r-1"),
      definition: DefinitionRef {
        name: "web".into(),
        version: 1,
      },
      trigger: TriggerRef {
        branch: "main".into(),
        commit: "abc123".into(),
        event: EventType::Push,
      },
      stage_index: 0,
      attempt,
      input: None,
    }
  }

  fn executor() -> (Arc<InMemoryArtifactStore>, ShellStageExecutor, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let executor = ShellStageExecutor::new(artifacts.clone(), dir.path());
    (artifacts, executor, dir)
  }

  #[tokio::test]
  async fn commands_see_run_environment_and_produce_artifact() {
    let (artifacts, executor, _dir) = executor();
    let stage = StageSpec::new("Build")
      .command("test \"$CONVEYOR_COMMIT\" = abc123")
      .command("printf '%s@%s' \"$CONVEYOR_STAGE\" \"$CONVEYOR_ATTEMPT\" > \"$CONVEYOR_OUTPUT\"")
      .produces_artifact();

    let outcome = executor.execute(&ctx(2), &stage, CancellationToken::new()).await.unwrap();
    let StageOutcome::Success { artifact: Some(artifact) } = outcome else {
      panic!("expected success with artifact, got {:?}", outcome);
    };
    assert_eq!(artifacts.get(&artifact).await.unwrap(), b"Build@2".to_vec());
  }

  #[tokio::test]
  async fn input_artifact_is_materialized() {
    let (artifacts, executor, _dir) = executor();
    let input = artifacts.put(&RunId::from("r-1"), "Source", b"payload".to_vec()).await.unwrap();
    let mut context = ctx(1);
    context.input = Some(input);
    let stage = StageSpec::new("Build").command("grep -q payload \"$CONVEYOR_INPUT\"");

    let outcome = executor.execute(&context, &stage, CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, StageOutcome::success());
  }

  #[tokio::test]
  async fn failing_command_stops_the_sequence() {
    let (_artifacts, executor, _dir) = executor();
    let stage = StageSpec::new("Test")
      .command("echo boom >&2; exit 3")
      .command("touch should-not-run");

    let outcome = executor.execute(&ctx(1), &stage, CancellationToken::new()).await.unwrap();
    match outcome {
      StageOutcome::Failure {
        reason: FailureReason::CommandFailed { exit_code, .. },
        diagnostic: Some(diagnostic),
      } => {
        assert_eq!(exit_code, Some(3));
        assert_eq!(diagnostic.stderr_tail.as_deref(), Some("boom\n"));
      }
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn missing_output_is_a_stage_failure() {
    let (_artifacts, executor, _dir) = executor();
    let stage = StageSpec::new("Build").command("true").produces_artifact();
    let outcome = executor.execute(&ctx(1), &stage, CancellationToken::new()).await.unwrap();
    assert!(matches!(
      outcome,
      StageOutcome::Failure {
        reason: FailureReason::MissingArtifact,
        ..
      }
    ));
  }

  #[tokio::test]
  async fn leftovers_of_a_crashed_attempt_are_cleared() {
    let (_artifacts, executor, dir) = executor();
    let stage = StageSpec::new("Build").command("true").produces_artifact();
    let leftover = dir.path().join("r-1").join("Build-1");
    tokio::fs::create_dir_all(&leftover).await.unwrap();
    tokio::fs::write(leftover.join(OUTPUT_FILE), b"stale").await.unwrap();

    let outcome = executor.execute(&ctx(1), &stage, CancellationToken::new()).await.unwrap();
    assert!(matches!(
      outcome,
      StageOutcome::Failure {
        reason: FailureReason::MissingArtifact,
        ..
      }
    ));
    assert!(!leftover.exists());
  }

  #[tokio::test]
  async fn cancellation_interrupts_a_running_command() {
    let (_artifacts, executor, _dir) = executor();
    let stage = StageSpec::new("Deploy").command("sleep 30");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      trigger.cancel();
    });

    let started = std::time::Instant::now();
    let outcome = executor.execute(&ctx(1), &stage, cancel).await.unwrap();
    assert!(outcome.is_cancellation());
    assert!(started.elapsed() < Duration::from_secs(10));
  }
}
