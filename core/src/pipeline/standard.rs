// conveyor/src/pipeline/standard.rs

//! The canonical Source → Build → Approve → Deploy pipeline for a CDK project
//! hosted on GitHub.

use crate::pipeline::definition::PipelineDefinition;
use crate::pipeline::stage::StageSpec;
use crate::pipeline::trigger::{EventType, TriggerFilter};

/// Where the standard pipeline pulls its sources from.
#[derive(Debug, Clone)]
pub struct SourceRepository {
  pub owner: String,
  pub repo: String,
  pub branch: String,
}

impl SourceRepository {
  pub fn clone_url(&self) -> String {
    format!("https://github.com/{}/{}.git", self.owner, self.repo)
  }
}

impl PipelineDefinition {
  /// Builds `{prefix}-pipeline`, triggered by pushes and pull requests on the tracked branch.
  ///
  /// Artifacts are gzipped tarballs of the checked-out tree.
  pub fn standard(prefix: &str, source: &SourceRepository) -> PipelineDefinition {
    let unpack = "mkdir -p src && tar -xzf \"$CONVEYOR_INPUT\" -C src";
    let pack = "tar -czf \"$CONVEYOR_OUTPUT\" -C src .";

    PipelineDefinition::new(format!("{}-pipeline", prefix), 1)
      .with_trigger(
        TriggerFilter::new()
          .on_event(EventType::Push)
          .on_event(EventType::PullRequest)
          .on_branch(source.branch.clone()),
      )
      .with_stage(
        StageSpec::new("Source")
          .command(format!(
            "git clone --no-checkout --branch \"$CONVEYOR_BRANCH\" {} src",
            source.clone_url()
          ))
          .command("git -C src checkout --detach \"$CONVEYOR_COMMIT\"")
          .command(pack)
          .produces_artifact(),
      )
      .with_stage(
        StageSpec::new("Build")
          .consumes("Source")
          .command(unpack)
          .commands([
            "cd src && npm ci",
            "cd src && npm run build",
            "cd src && npm run test",
            "cd src && npx cdk synth",
          ])
          .command(pack)
          .produces_artifact(),
      )
      .with_stage(StageSpec::approval("Approve"))
      .with_stage(
        StageSpec::new("Deploy")
          .consumes("Build")
          .command(unpack)
          .command("cd src && npx cdk deploy --all --require-approval never"),
      )
  }
}
