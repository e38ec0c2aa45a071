// Integration tests for checkpoint/resume: a build interrupted and resumed from
// a reopened SQLite store ends with the same artifact as an uninterrupted run

use anyhow::Result;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use appweaver::backend::LocalSqlExecutor;
use appweaver::build::{
    BuildEngine, BuildObserver, BuildOutcome, BuildRequest, BuildSettings, BuildSupervisor,
    NoopObserver,
};
use appweaver::oracle::{CallEnvelope, OracleRequest, OracleTask, ScriptedOracle};
use appweaver::project::{CodeArtifact, Project, ProjectStatus};
use appweaver::store::{ProjectStore, SqliteProjectStore};

const PLAN: &str = r#"[{"description":"Add header","kind":"code"},{"description":"Add footer","kind":"code"},{"description":"Add sidebar","kind":"code"}]"#;

/// Deterministic code step: appends `stepN();` to whatever script the prompt carries
fn accumulate(request: &OracleRequest) -> Result<String> {
    let step = request
        .prompt
        .split("Current step (")
        .nth(1)
        .and_then(|rest| rest.split(' ').next())
        .unwrap_or("?");
    let script = request
        .prompt
        .split("Current script:\n```javascript\n")
        .nth(1)
        .and_then(|rest| rest.split("\n```").next())
        .unwrap_or("");
    Ok(json!({
        "html": format!("<main data-step=\"{step}\"></main>"),
        "script": format!("{script}step{step}();"),
        "explanation": format!("applied step {step}"),
    })
    .to_string())
}

fn deterministic_oracle() -> ScriptedOracle {
    ScriptedOracle::new()
        .respond_with(OracleTask::Classify, |_| Ok("ARCHITECT".into()))
        .respond_with(OracleTask::DetectBackend, |_| Ok(r#"{"requiresDatabase":false}"#.into()))
        .respond_with(OracleTask::Plan, |_| Ok(PLAN.into()))
        .respond_with(OracleTask::CodeStep, accumulate)
}

fn engine(oracle: ScriptedOracle, db: &Path) -> Result<BuildEngine> {
    let store = Arc::new(SqliteProjectStore::open(db)?);
    let settings = BuildSettings {
        envelope: CallEnvelope::new(0, Duration::from_millis(1), Duration::from_secs(5)),
        ..Default::default()
    };
    Ok(BuildEngine::new(
        Arc::new(oracle),
        store,
        Arc::new(LocalSqlExecutor::new()),
        settings,
    ))
}

struct CancelAfterStep {
    token: CancellationToken,
    step: usize,
}

impl BuildObserver for CancelAfterStep {
    fn on_step_completed(&self, index: usize) {
        if index == self.step {
            self.token.cancel();
        }
    }
}

#[tokio::test]
async fn test_resume_matches_uninterrupted_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("projects.db");

    // Uninterrupted reference run
    let reference = Project::new("eve", "reference");
    let first = engine(deterministic_oracle(), &db)?;
    first.store().save(&reference).await?;
    let expected = match first
        .run(&reference.id, BuildRequest::new("a simple layout"), &NoopObserver, &CancellationToken::new())
        .await?
    {
        BuildOutcome::Success { artifact } => artifact,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(expected.script, "step1();step2();step3();");

    // Interrupted run, cancelled after the first step
    let interrupted = Project::new("eve", "interrupted");
    first.store().save(&interrupted).await?;
    let token = CancellationToken::new();
    let observer = CancelAfterStep {
        token: token.clone(),
        step: 0,
    };
    let outcome = first
        .run(&interrupted.id, BuildRequest::new("a simple layout"), &observer, &token)
        .await?;
    assert_eq!(outcome, BuildOutcome::Cancelled);
    drop(first);

    // Reopen the store as a fresh process would
    let second = engine(deterministic_oracle(), &db)?;
    let reloaded = second.store().load(&interrupted.id).await?.unwrap();
    let state = reloaded.build_state.as_ref().unwrap();
    assert_eq!(state.last_completed_step, 0);
    assert_eq!(state.resume_index(), 1);
    assert_eq!(reloaded.artifact.script, "step1();");

    let outcome = second
        .resume(&interrupted.id, &NoopObserver, &CancellationToken::new())
        .await?;
    assert_eq!(outcome, BuildOutcome::Success { artifact: expected.clone() });

    let saved = second.store().load(&interrupted.id).await?.unwrap();
    assert_eq!(saved.artifact, expected);
    assert!(saved.build_state.is_none());
    assert_eq!(saved.status, ProjectStatus::Idle);
    Ok(())
}

#[tokio::test]
async fn test_resume_retries_failed_step() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("projects.db");

    let failing = ScriptedOracle::new()
        .respond_with(OracleTask::Classify, |_| Ok("ARCHITECT".into()))
        .respond_with(OracleTask::DetectBackend, |_| Ok(r#"{"requiresDatabase":false}"#.into()))
        .respond_with(OracleTask::Plan, |_| Ok(PLAN.into()))
        .respond_with(OracleTask::CodeStep, |request| {
            if request.prompt.contains("Current step (2 of 3)") {
                Ok("unavailable".into())
            } else {
                accumulate(request)
            }
        })
        .respond_with(OracleTask::Repair, |_| Err(anyhow::anyhow!("repair offline")));

    let project = Project::new("eve", "retry");
    let first = engine(failing, &db)?;
    first.store().save(&project).await?;
    let outcome = first
        .run(&project.id, BuildRequest::new("a simple layout"), &NoopObserver, &CancellationToken::new())
        .await?;
    assert_eq!(outcome.label(), "failed");

    let failed = first.store().load(&project.id).await?.unwrap();
    assert!(failed.build_state.as_ref().unwrap().error.is_some());
    assert_eq!(failed.artifact.script, "step1();");

    let second = engine(deterministic_oracle(), &db)?;
    let outcome = second
        .resume(&project.id, &NoopObserver, &CancellationToken::new())
        .await?;
    match outcome {
        BuildOutcome::Success { artifact } => {
            assert_eq!(artifact.script, "step1();step2();step3();")
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    // Resume builds against the original request
    let user_messages = second
        .store()
        .load(&project.id)
        .await?
        .unwrap()
        .messages
        .iter()
        .filter(|m| m.role == appweaver::project::Role::User)
        .count();
    assert_eq!(user_messages, 1);
    Ok(())
}

#[tokio::test]
async fn test_supervisor_resume_runs_to_completion() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("projects.db");

    let project = Project::new("eve", "supervised");
    let first = engine(deterministic_oracle(), &db)?;
    first.store().save(&project).await?;
    let token = CancellationToken::new();
    let observer = CancelAfterStep {
        token: token.clone(),
        step: 1,
    };
    first
        .run(&project.id, BuildRequest::new("a simple layout"), &observer, &token)
        .await?;

    let supervisor = BuildSupervisor::new(Arc::new(engine(deterministic_oracle(), &db)?));
    let job = supervisor.resume(&project.id, Arc::new(NoopObserver)).await;
    let outcome = job.wait().await?;
    match outcome {
        BuildOutcome::Success { artifact } => {
            assert_eq!(artifact.script, "step1();step2();step3();")
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!supervisor.is_running(&project.id));
    Ok(())
}

/// Cancels as soon as a repaired script lands
struct CancelOnRepair {
    token: CancellationToken,
}

impl BuildObserver for CancelOnRepair {
    fn on_artifact_updated(&self, artifact: &CodeArtifact) {
        if artifact.script == "patched();" {
            self.token.cancel();
        }
    }
}

#[tokio::test]
async fn test_repair_before_cancel_does_not_leak_into_resume() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("projects.db");
    let two_steps = r#"[{"description":"Add header","kind":"code"},{"description":"Add footer","kind":"code"}]"#;
    let stable = r#"{"html":"<header></header>","script":"stable();","explanation":"header"}"#;

    let repairing = ScriptedOracle::new()
        .respond_with(OracleTask::Classify, |_| Ok("ARCHITECT".into()))
        .respond_with(OracleTask::DetectBackend, |_| Ok(r#"{"requiresDatabase":false}"#.into()))
        .respond_with(OracleTask::Plan, move |_| Ok(two_steps.into()))
        .respond_with(OracleTask::CodeStep, move |request| {
            if request.prompt.contains("Current step (1 of 2)") {
                Ok(stable.into())
            } else {
                Ok("no patch here".into())
            }
        })
        .respond_with(OracleTask::Repair, |_| {
            Ok(r#"{"script":"patched();","explanation":"guessed"}"#.into())
        });

    let project = Project::new("eve", "leak");
    let first = engine(repairing, &db)?;
    first.store().save(&project).await?;
    let token = CancellationToken::new();
    let outcome = first
        .run(
            &project.id,
            BuildRequest::new("header and footer"),
            &CancelOnRepair { token: token.clone() },
            &token,
        )
        .await?;
    assert_eq!(outcome, BuildOutcome::Cancelled);
    drop(first);

    // The repair was committed mid-step, but the step baseline survives with it
    let second = engine(deterministic_oracle(), &db)?;
    let interrupted = second.store().load(&project.id).await?.unwrap();
    let state = interrupted.build_state.as_ref().unwrap();
    assert_eq!(state.last_completed_step, 0);
    assert_eq!(
        state.step_baseline.as_ref().map(|a| a.script.as_str()),
        Some("stable();")
    );
    drop(second);

    let prompts = Arc::new(Mutex::new(Vec::new()));
    let seen = prompts.clone();
    let exhausting = ScriptedOracle::new()
        .respond_with(OracleTask::CodeStep, move |request| {
            if let Ok(mut seen) = seen.lock() {
                seen.push(request.prompt.clone());
            }
            Ok("still no patch".into())
        })
        .respond_with(OracleTask::Repair, |_| Err(anyhow::anyhow!("repair offline")));

    let third = engine(exhausting, &db)?;
    let outcome = third
        .resume(&project.id, &NoopObserver, &CancellationToken::new())
        .await?;
    assert_eq!(outcome.label(), "failed");

    let saved = third.store().load(&project.id).await?.unwrap();
    assert_eq!(saved.artifact.script, "stable();");
    assert!(saved.build_state.as_ref().unwrap().step_baseline.is_none());

    let prompts = prompts.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.clone();
    assert!(!prompts.is_empty());
    assert!(prompts.iter().all(|p| !p.contains("patched();")));
    Ok(())
}
