// Appweaver - resumable build orchestration for generated web apps
// Main entry point

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use crossterm::style::Stylize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use appweaver::backend::{provision_project, LocalProvisioner, LocalSqlExecutor};
use appweaver::build::{
    BuildEngine, BuildFailure, BuildObserver, BuildOutcome, BuildRequest, BuildSettings,
    BuildSupervisor,
};
use appweaver::config::{resolve_config, Config};
use appweaver::oracle::GeminiOracle;
use appweaver::planning::PlanStep;
use appweaver::project::{CodeArtifact, ImageAttachment, Project, ProjectId};
use appweaver::store::{ProjectStore, SqliteProjectStore};

#[derive(Parser, Debug)]
#[command(name = "appweaver", version, about = "Build web apps from natural language")]
struct Cli {
    /// Config file (defaults to ~/.appweaver/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty project
    New {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value = "Untitled app")]
        name: String,
    },
    /// Send an instruction to a project
    Build {
        project: ProjectId,
        prompt: String,
        /// Reference image(s) sent with the instruction
        #[arg(long = "image")]
        images: Vec<PathBuf>,
    },
    /// Continue an interrupted or failed build
    Resume { project: ProjectId },
    /// Print a project
    Show {
        project: ProjectId,
        /// Print the full JSON document
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List an owner's projects
    List {
        #[arg(long)]
        owner: String,
    },
    /// Create a local database backend for a project
    Provision { project: ProjectId },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let needs_oracle = matches!(cli.command, Command::Build { .. } | Command::Resume { .. });
    let config = resolve_config(cli.config.as_deref(), needs_oracle)?;

    let store = open_store(&config)?;

    match cli.command {
        Command::New { owner, name } => {
            let project = Project::new(owner, name);
            store.save(&project).await?;
            println!("{}", project.id);
        }
        Command::Build {
            project,
            prompt,
            images,
        } => {
            let images = images
                .iter()
                .map(|path| load_image(path))
                .collect::<Result<Vec<_>>>()?;
            let request = BuildRequest::new(prompt).with_images(images);
            let supervisor = supervisor(&config, store)?;
            let job = supervisor
                .start(&project, request, Arc::new(ConsoleObserver))
                .await;
            report(watch_job(job).await?);
        }
        Command::Resume { project } => {
            let supervisor = supervisor(&config, store)?;
            let job = supervisor.resume(&project, Arc::new(ConsoleObserver)).await;
            report(watch_job(job).await?);
        }
        Command::Show { project, json } => {
            let project = store
                .load(&project)
                .await?
                .with_context(|| format!("Project {project} not found"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&project)?);
            } else {
                print_project(&project);
            }
        }
        Command::List { owner } => {
            for project in store.list_for_owner(&owner).await? {
                println!(
                    "{}  {}  {:?}  {}",
                    project.id,
                    project.updated_at.format("%Y-%m-%d %H:%M"),
                    project.status,
                    project.name
                );
            }
        }
        Command::Provision { project } => {
            let provisioner = LocalProvisioner::new(&config.backend.data_dir);
            let backend = provision_project(
                store.as_ref(),
                &provisioner,
                &project,
                Duration::from_millis(config.backend.provision_poll_ms),
                Duration::from_secs(config.backend.provision_timeout_secs),
            )
            .await?;
            println!("{} {:?}", backend.reference, backend.status);
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "appweaver=debug,info" } else { "appweaver=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(config: &Config) -> Result<Arc<dyn ProjectStore>> {
    if let Some(parent) = config.store.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(Arc::new(SqliteProjectStore::open(&config.store.db_path)?))
}

fn supervisor(config: &Config, store: Arc<dyn ProjectStore>) -> Result<BuildSupervisor> {
    let oracle = GeminiOracle::from_config(&config.oracle)?;
    let engine = BuildEngine::new(
        Arc::new(oracle),
        store,
        Arc::new(LocalSqlExecutor::new()),
        BuildSettings::from_config(config),
    );
    Ok(BuildSupervisor::new(Arc::new(engine)))
}

/// Wait for the job; ctrl-c asks it to stop at the next checkpoint
async fn watch_job(job: appweaver::build::BuildJob) -> Result<BuildOutcome> {
    let token = job.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", "Cancelling at the next checkpoint...".yellow());
            token.cancel();
        }
    });
    let outcome = job.wait().await;
    interrupt.abort();
    outcome
}

fn report(outcome: BuildOutcome) {
    match outcome {
        BuildOutcome::Chat { reply } => println!("{reply}"),
        BuildOutcome::Success { artifact } => {
            println!("{} {}", "✓".green().bold(), summarize(&artifact));
        }
        BuildOutcome::BackendRequired { .. } => {
            println!(
                "{} This request needs a database. Run `appweaver provision <project>` and try again.",
                "!".yellow().bold()
            );
        }
        BuildOutcome::Failed { index, step, error } => {
            println!(
                "{} Step {} \"{}\" failed: {}\n  Run `appweaver resume <project>` to retry.",
                "✗".red().bold(),
                index + 1,
                step,
                error
            );
        }
        BuildOutcome::Cancelled => println!("{}", "Cancelled. Progress is saved.".dark_grey()),
    }
}

fn summarize(artifact: &CodeArtifact) -> String {
    format!(
        "html {}B, script {}B, stylesheet {}B",
        artifact.html.len(),
        artifact.script.len(),
        artifact.stylesheet.len()
    )
}

fn print_project(project: &Project) {
    println!("{} {}", project.name.clone().bold(), project.id.clone().dark_grey());
    println!("owner: {}  status: {:?}", project.owner, project.status);
    match &project.backend {
        Some(backend) if backend.is_active() => println!("backend: {}", "active".green()),
        Some(_) => println!("backend: {}", "pending".yellow()),
        None => println!("backend: none"),
    }
    if let Some(state) = &project.build_state {
        println!(
            "build: step {}/{} (last completed {})",
            state.current_step + 1,
            state.plan.len(),
            state.last_completed_step
        );
        if let Some(error) = &state.error {
            println!("  {}", error.clone().red());
        }
    }
    println!("artifact: {}", summarize(&project.artifact));
    println!("{}", "─".repeat(60).dark_grey());
    for message in &project.messages {
        println!("[{}] {}", message.role.as_str(), message.content);
    }
}

fn load_image(path: &Path) -> Result<ImageAttachment> {
    let mime_type = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => bail!("Unsupported image type: {}", path.display()),
    };
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))?;
    Ok(ImageAttachment {
        mime_type: mime_type.to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(bytes),
    })
}

/// Prints build progress to stdout
struct ConsoleObserver;

impl BuildObserver for ConsoleObserver {
    fn on_plan_published(&self, plan: &[PlanStep]) {
        println!("{}", "Plan".bold());
        for (i, step) in plan.iter().enumerate() {
            println!("  {}. {} {}", i + 1, step.description, format!("[{}]", step.kind.as_str()).dark_grey());
        }
    }

    fn on_step_started(&self, index: usize, step: &PlanStep) {
        println!("{} {}", format!("[{}]", index + 1).cyan(), step.description);
    }

    fn on_step_completed(&self, index: usize) {
        println!("{} step {}", "✓".green(), index + 1);
    }

    fn on_step_degraded(&self, index: usize, error: &str) {
        println!("{} step {} skipped: {}", "!".yellow(), index + 1, error);
    }

    fn on_recoverable_error(&self, index: usize, error: &str, remaining: u32) {
        println!(
            "{} step {} failed ({} attempt(s) left): {}",
            "↻".yellow(),
            index + 1,
            remaining,
            error
        );
    }

    fn on_final_error(&self, failure: &BuildFailure) {
        tracing::debug!("Final error: {}", failure.describe());
    }
}
