//! Boxman CLI - declarative libvirt VM clusters.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use boxman::access::SshCopyId;
use boxman::config::{load_app_config, load_project, AppConfig, ProjectConfig};
use boxman::control::virsh::VirshControlPlane;
use boxman::executor::{create_executor, LocalExecutor};
use boxman::graph::ImageSource;
use boxman::power::PowerAction;
use boxman::registry::ProjectRegistry;
use boxman::tasks::{list_tasks, resolve_task, run_task};
use boxman::{Executor, Machines, Orchestrator, OrchestratorSettings, ResourceGraph, RunReport, RuntimeKind};

/// Boxman - provision and manage clusters of libvirt VMs.
#[derive(Parser)]
#[command(name = "boxman")]
#[command(about = "Provision and manage clusters of libvirt VMs", version)]
struct Cli {
    /// Project configuration file.
    #[arg(short, long, default_value = "conf.yml")]
    conf: PathBuf,

    /// Application configuration file (default: ~/.config/boxman/boxman.yml).
    #[arg(long, env = "BOXMAN_CONF")]
    boxman_conf: Option<PathBuf>,

    /// Where virsh and friends run.
    #[arg(long, value_enum)]
    runtime: Option<RuntimeKind>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create networks and VMs and set up SSH access.
    Provision {
        /// Re-clone existing VMs and take over the project name if it is
        /// registered from another config file.
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Remove the project's VMs and networks.
    Deprovision {
        /// Also remove the libvirt container once everything is gone.
        #[arg(long, default_value = "false")]
        destroy_runtime: bool,
    },

    /// Provision if anything is missing, otherwise bring every VM up.
    Up,

    /// Start VMs.
    Start {
        /// Comma-separated VM names, or `all`.
        #[arg(long, default_value = "all")]
        machines: Machines,
    },

    /// Pause, resume, save or restore VMs.
    Suspend {
        action: SuspendAction,

        /// Comma-separated VM names, or `all`.
        #[arg(long, default_value = "all")]
        machines: Machines,
    },

    /// Manage VM snapshots.
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },

    /// Build template VMs from cloud images with cloud-init.
    CreateTemplates {
        /// Comma-separated template names, or `all`.
        #[arg(long, default_value = "all")]
        templates: Machines,

        /// Replace templates that already exist.
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// List registered projects.
    List,

    /// Show how to reach each VM.
    ConnectInfo,

    /// List the project's tasks.
    Tasks,

    /// Run a project task.
    Run {
        /// Task name.
        task: String,

        /// Extra arguments appended to the task command.
        #[arg(last = true)]
        args: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SuspendAction {
    Pause,
    Resume,
    Save,
    Restore,
}

impl From<SuspendAction> for PowerAction {
    fn from(action: SuspendAction) -> Self {
        match action {
            SuspendAction::Pause => Self::Pause,
            SuspendAction::Resume => Self::Resume,
            SuspendAction::Save => Self::Save,
            SuspendAction::Restore => Self::Restore,
        }
    }
}

#[derive(Subcommand)]
enum SnapshotCommand {
    /// Take a snapshot.
    Create {
        /// Snapshot name (default: current UTC time).
        #[arg(short, long)]
        name: Option<String>,

        /// Description.
        #[arg(short = 'm', long)]
        description: Option<String>,

        #[arg(long, default_value = "all")]
        machines: Machines,
    },

    /// List snapshots.
    List {
        #[arg(long, default_value = "all")]
        machines: Machines,
    },

    /// Revert to a snapshot.
    Restore {
        #[arg(short, long)]
        name: String,

        #[arg(long, default_value = "all")]
        machines: Machines,
    },

    /// Delete a snapshot.
    Delete {
        #[arg(short, long)]
        name: String,

        #[arg(long, default_value = "all")]
        machines: Machines,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

/// Everything a project-level command needs.
struct Project {
    config: ProjectConfig,
    graph: ResourceGraph,
}

fn load(path: &Path) -> Result<Project> {
    let config = load_project(path)
        .with_context(|| format!("Failed to load project configuration {}", path.display()))?;
    let graph = ResourceGraph::build(&config).context("Invalid project configuration")?;
    Ok(Project { config, graph })
}

fn orchestrator(cli: &Cli, app: &AppConfig, project: &Project) -> Orchestrator {
    let config = &project.config;
    let mut runtime = app.runtime.clone();
    runtime.kind = cli.runtime.or(config.runtime).unwrap_or(runtime.kind);
    let graph = &project.graph;
    let workdirs: Vec<PathBuf> = graph
        .clusters
        .iter()
        .map(|c| c.workdir.clone())
        .chain(graph.templates.iter().map(|t| t.workdir.clone()))
        .chain(graph.templates.iter().filter_map(|t| match &t.image {
            ImageSource::Local(path) => path.parent().map(Path::to_path_buf),
            ImageSource::Url(_) => None,
        }))
        .collect();
    let executor = create_executor(&runtime, &config.project, &workdirs);
    let host: Arc<dyn Executor> = Arc::new(LocalExecutor::new());
    debug!(runtime = executor.name(), project = %config.project, "Executor selected");

    let libvirt = config
        .provider
        .libvirt
        .clone()
        .unwrap_or_else(|| app.providers.libvirt.clone());
    let control = Arc::new(VirshControlPlane::new(executor.clone(), libvirt));
    let copier = Arc::new(SshCopyId::new(host.clone()));

    let settings = OrchestratorSettings {
        force: matches!(cli.command, Commands::Provision { force: true }),
        destroy_runtime: matches!(cli.command, Commands::Deprovision { destroy_runtime: true }),
        ..OrchestratorSettings::from_timing(&app.timing)
    };
    Orchestrator::new(
        control,
        executor,
        host,
        copier,
        ProjectRegistry::default_location(),
        settings,
    )
}

fn finish(report: &RunReport, title: &str) -> u8 {
    report.print_summary(title);
    report.exit_code()
}

async fn run(cli: Cli) -> Result<u8> {
    let app = load_app_config(cli.boxman_conf.as_deref()).context("Failed to load application configuration")?;

    if matches!(cli.command, Commands::List) {
        let projects = ProjectRegistry::default_location().list()?;
        if projects.is_empty() {
            println!("No registered projects");
            return Ok(0);
        }
        println!("\n{:<24} {:<26} {}", "PROJECT", "REGISTERED", "CONFIG");
        println!("{}", "-".repeat(80));
        for (name, entry) in projects {
            println!(
                "{:<24} {:<26} {}",
                name,
                entry.registered_at.format("%Y-%m-%d %H:%M:%S UTC"),
                entry.conf.display()
            );
        }
        return Ok(0);
    }

    let project = load(&cli.conf)?;
    let boxman = orchestrator(&cli, &app, &project);
    let Project { config, graph } = project;

    let code = match cli.command {
        Commands::Provision { .. } => {
            let report = boxman.provision(&graph, &cli.conf).await?;
            finish(&report, "Provision")
        }
        Commands::Deprovision { .. } => {
            let report = boxman.deprovision(&graph).await?;
            finish(&report, "Deprovision")
        }
        Commands::Up => {
            let report = boxman.up(&graph, &cli.conf).await?;
            finish(&report, "Up")
        }
        Commands::Start { ref machines } => {
            let report = boxman.power(&graph, machines, PowerAction::Start).await?;
            finish(&report, "Start")
        }
        Commands::Suspend { action, ref machines } => {
            let action = PowerAction::from(action);
            let report = boxman.power(&graph, machines, action).await?;
            finish(&report, &format!("Suspend ({action})"))
        }
        Commands::Snapshot { ref command } => snapshot(&boxman, &graph, command).await?,
        Commands::CreateTemplates { ref templates, force } => {
            let report = boxman.create_templates(&graph, templates, force).await?;
            finish(&report, "Create templates")
        }
        Commands::ConnectInfo => {
            for info in boxman.connect_info(&graph).await? {
                println!("\n{} ({}) - {}", info.vm.bold(), info.hostname, info.state);
                if info.addresses.is_empty() {
                    println!("  {}", "no address".dimmed());
                }
                for address in &info.addresses {
                    println!(
                        "  ssh -i {} {}@{address}",
                        info.key_path.display(),
                        info.user
                    );
                }
                println!("  ssh -F {} {}", info.ssh_config.display(), info.hostname);
            }
            0
        }
        Commands::Tasks => {
            let tasks = list_tasks(&config);
            if tasks.is_empty() {
                println!("No tasks defined");
            }
            for (name, description) in tasks {
                println!("  {:<20} {}", name.bold(), description);
            }
            0
        }
        Commands::Run { ref task, ref args } => {
            let project_dir = cli
                .conf
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            let task = resolve_task(&config, &project_dir, task)?;
            let code = run_task(&config.project, &task, args).await?;
            u8::try_from(code).unwrap_or(1)
        }
        Commands::List => 0,
    };
    Ok(code)
}

async fn snapshot(boxman: &Orchestrator, graph: &ResourceGraph, command: &SnapshotCommand) -> Result<u8> {
    let code = match command {
        SnapshotCommand::Create {
            name,
            description,
            machines,
        } => {
            let report = boxman
                .snapshot_create(graph, machines, name.as_deref(), description.as_deref())
                .await?;
            finish(&report, "Snapshot create")
        }
        SnapshotCommand::List { machines } => {
            let (listed, report) = boxman.snapshot_list(graph, machines).await?;
            for vm in listed {
                println!("\n{}", vm.vm.bold());
                if vm.snapshots.is_empty() {
                    println!("  {}", "no snapshots".dimmed());
                }
                for snapshot in vm.snapshots {
                    println!(
                        "  {:<24} {:<10} {}",
                        snapshot.name,
                        snapshot.state.unwrap_or_default(),
                        snapshot.description.unwrap_or_default()
                    );
                }
            }
            if report.failures().is_empty() {
                0
            } else {
                finish(&report, "Snapshot list")
            }
        }
        SnapshotCommand::Restore { name, machines } => {
            let report = boxman.snapshot_restore(graph, machines, name).await?;
            finish(&report, "Snapshot restore")
        }
        SnapshotCommand::Delete { name, machines } => {
            let report = boxman.snapshot_delete(graph, machines, name).await?;
            finish(&report, "Snapshot delete")
        }
    };
    Ok(code)
}
