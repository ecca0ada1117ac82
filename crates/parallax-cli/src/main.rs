//! Parallax command line interface.
//!
//! Drives the build engine against a running controller: one-shot builds and
//! deploys, the dev loop, and cluster status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use parallax_engine::{
    ControllerClient, Engine, EngineConfig, EngineEvent, HttpControllerClient,
};

const SCHEMA_POLL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "parallax", about = "Build and deploy Parallax modules")]
struct Cli {
    /// Controller endpoint.
    #[arg(long, default_value = "http://127.0.0.1:8892")]
    endpoint: String,

    /// Project root directory.
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build modules without deploying. Builds everything when no modules
    /// are named.
    Build { modules: Vec<String> },
    /// Build and deploy modules.
    Deploy {
        modules: Vec<String>,
        /// Replicas to request per deployment.
        #[arg(long, default_value_t = 1)]
        replicas: u32,
        /// Return without waiting for replicas to come up.
        #[arg(long)]
        no_wait: bool,
    },
    /// Build, deploy and rebuild on change until interrupted.
    Dev,
    /// Show cluster status.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("parallax=warn".parse()?))
        .init();

    let cli = Cli::parse();
    let config: EngineConfig = Figment::new()
        .merge(Toml::file("parallax-project.toml"))
        .merge(Env::prefixed("PARALLAX_").split("_"))
        .extract()?;
    let controller: Arc<dyn ControllerClient> =
        Arc::new(HttpControllerClient::new(cli.endpoint.clone(), SCHEMA_POLL));

    if let Command::Status = cli.command {
        return status(controller.as_ref()).await;
    }

    let project_root = cli
        .project_root
        .canonicalize()
        .with_context(|| format!("project root {} not found", cli.project_root.display()))?;
    let idle_debounce = config.idle_debounce;
    let engine = Engine::new(
        controller,
        config,
        project_root.clone(),
        vec![project_root],
    );
    spawn_printer(engine.subscribe());

    match cli.command {
        Command::Build { modules } => {
            let modules = resolve_modules(&engine, modules).await?;
            engine.build(&modules).await?;
            drain(idle_debounce).await;
        }
        Command::Deploy {
            modules,
            replicas,
            no_wait,
        } => {
            let modules = resolve_modules(&engine, modules).await?;
            engine.build_and_deploy(&modules, replicas, !no_wait).await?;
            drain(idle_debounce).await;
        }
        Command::Dev => {
            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                });
            }
            engine.dev(cancel).await?;
        }
        Command::Status => unreachable!(),
    }
    Ok(())
}

/// Discover the project; named modules must exist, no names means all.
async fn resolve_modules(engine: &Engine, named: Vec<String>) -> anyhow::Result<Vec<String>> {
    let discovered = engine.discover_and_add().await?;
    if named.is_empty() {
        return Ok(discovered);
    }
    for name in &named {
        if !discovered.contains(name) {
            anyhow::bail!("module {name} not found in this project");
        }
    }
    Ok(named)
}

async fn status(controller: &dyn ControllerClient) -> anyhow::Result<()> {
    let status = controller.status().await?;
    println!("controllers:");
    for c in &status.controllers {
        println!("  {} {}", c.key, c.endpoint);
    }
    println!("runners:");
    for r in &status.runners {
        let deployment = r
            .deployment
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".into());
        println!("  {} {} {:?} {}", r.key, r.endpoint, r.state, deployment);
    }
    println!("deployments:");
    for d in &status.deployments {
        println!(
            "  {} {} {}/{} replicas",
            d.name, d.language, d.assigned_replicas, d.min_replicas
        );
    }
    println!("ingress:");
    for i in &status.ingress_routes {
        println!("  {} {} -> {}.{}", i.method, i.path, i.module, i.verb);
    }
    Ok(())
}

/// Give the debounced end-of-run summary time to print before exiting.
async fn drain(idle_debounce: Duration) {
    tokio::time::sleep(idle_debounce + Duration::from_millis(200)).await;
}

fn spawn_printer(mut rx: broadcast::Receiver<EngineEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::EngineStarted => println!("engine: building"),
        EngineEvent::EngineEnded { module_errors } => {
            if module_errors.is_empty() {
                println!("engine: idle");
            } else {
                println!("engine: idle with {} failing module(s)", module_errors.len());
                let mut failed: Vec<_> = module_errors.iter().collect();
                failed.sort();
                for (module, error) in failed {
                    println!("  {module}: {error}");
                }
            }
        }
        EngineEvent::ModuleAdded { module } => println!("{module}: added"),
        EngineEvent::ModuleRemoved { module } => println!("{module}: removed"),
        EngineEvent::ModuleBuildWaiting { module } => println!("{module}: waiting"),
        EngineEvent::ModuleBuildStarted {
            module,
            is_auto_rebuild,
        } => {
            if *is_auto_rebuild {
                println!("{module}: rebuilding");
            } else {
                println!("{module}: building");
            }
        }
        EngineEvent::ModuleBuildSuccess { module, .. } => println!("{module}: built"),
        EngineEvent::ModuleBuildFailed { module, error, .. } => {
            println!("{module}: build failed: {error}");
        }
        EngineEvent::ModuleDeployStarted { module } => println!("{module}: deploying"),
        EngineEvent::ModuleDeploySuccess { module } => println!("{module}: deployed"),
        EngineEvent::ModuleDeployFailed { module, error } => {
            println!("{module}: deploy failed: {error}");
        }
    }
}
