//! Operator CLI for the Cleanroom sandbox control plane (`spec.md` §6).
//!
//! `serve` hosts the Control API (unix socket) and egress gateway (HTTP) in
//! one process, grounded on the prior art's daemon-launch command; the
//! remaining subcommands are thin Control API clients.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod client;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use cleanroom_api::pb::execution_service_client::ExecutionServiceClient;
use cleanroom_api::pb::sandbox_service_client::SandboxServiceClient;
use cleanroom_api::pb::{
    execution_event, AllowRule, CancelExecutionRequest, CreateExecutionRequest,
    CreateSandboxRequest, ExecutionOptions, GetSandboxRequest, ListSandboxesRequest, Policy,
    SandboxOptions, StreamExecutionRequest, TerminateSandboxRequest,
};
use cleanroom_core::capability::EnvCredentialProvider;
use cleanroom_core::config::{default_cache_dir, default_run_dir, CoreConfig};
use cleanroom_core::ExtFsMaterializer;
use cleanroom_gateway::{Gateway, InMemoryScopeRegistry};
use cleanroom_oci::RegistryFetcher;
use tokio_stream::StreamExt as _;

/// Operator CLI for creating and driving Cleanroom sandboxes.
#[derive(Debug, Parser)]
#[command(name = "cleanroom", version, about)]
struct Cli {
    /// Path to the Control API's unix control socket.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs the Control API and egress gateway in the foreground.
    Serve(ServeArgs),
    /// Sandbox lifecycle operations.
    #[command(subcommand)]
    Sandbox(SandboxCommand),
    /// Runs a command inside a sandbox and streams its output.
    Exec(ExecArgs),
}

#[derive(Debug, Subcommand)]
enum SandboxCommand {
    /// Provisions a new sandbox.
    Create(SandboxCreateArgs),
    /// Lists known sandboxes.
    Ls,
    /// Terminates a sandbox.
    Rm {
        /// The sandbox id to terminate.
        sandbox_id: String,
    },
}

#[derive(Debug, clap::Args)]
struct ServeArgs {
    /// Base directory for the image and rootfs caches.
    #[arg(long)]
    cache_base: Option<PathBuf>,
    /// Base directory for per-sandbox run state.
    #[arg(long)]
    run_base: Option<PathBuf>,
    /// Path to the guest kernel image.
    #[arg(long)]
    kernel: PathBuf,
    /// Path to the `cleanroom-helper` binary.
    #[arg(long)]
    helper_binary: PathBuf,
    /// Path to the guest-agent binary injected into prepared rootfs images.
    #[arg(long)]
    guest_agent_binary: PathBuf,
    /// Bind address for the egress gateway.
    #[arg(long)]
    gateway_addr: Option<String>,
}

#[derive(Debug, clap::Args)]
struct SandboxCreateArgs {
    /// Backend name (e.g. `darwin-vz`, `firecracker`).
    #[arg(long, default_value = "darwin-vz")]
    backend: String,
    /// Digest-pinned OCI image reference.
    #[arg(long)]
    image: String,
    /// Allow-list entry as `host:port[,port...]`, repeatable.
    #[arg(long = "allow", value_parser = parse_allow_rule)]
    allow: Vec<AllowRule>,
    /// Virtual CPU count.
    #[arg(long, default_value_t = 0)]
    vcpus: u32,
    /// RAM size in MiB.
    #[arg(long, default_value_t = 0)]
    memory_mib: u32,
    /// Guest-agent readiness timeout in seconds.
    #[arg(long, default_value_t = 0)]
    launch_seconds: u32,
}

#[derive(Debug, clap::Args)]
struct ExecArgs {
    /// The sandbox to run the command in.
    sandbox_id: String,
    /// Allocates a pseudo-tty for the execution.
    #[arg(long)]
    tty: bool,
    /// The command and its arguments.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

/// Parses a `host:port[,port...]` allow-rule flag value.
fn parse_allow_rule(raw: &str) -> Result<AllowRule, String> {
    let (host, ports) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected host:port[,port...], got {raw:?}"))?;
    let ports = ports
        .split(',')
        .map(|p| p.trim().parse::<u32>().map_err(|e| e.to_string()))
        .collect::<Result<Vec<u32>, String>>()?;
    if ports.is_empty() {
        return Err(format!("allow rule for {host} has no ports"));
    }
    Ok(AllowRule {
        host: host.to_owned(),
        ports,
    })
}

/// Resolves the Control API socket path: the `--socket` flag, or the
/// default run-directory location (`spec.md` §6 on-disk layout).
fn resolve_socket_path(socket: Option<PathBuf>) -> PathBuf {
    socket.unwrap_or_else(|| cleanroom_api::default_socket_path(&default_run_dir()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let socket_path = resolve_socket_path(cli.socket);

    match cli.command {
        Command::Serve(args) => run_serve(socket_path, args).await,
        Command::Sandbox(SandboxCommand::Create(args)) => sandbox_create(&socket_path, args).await,
        Command::Sandbox(SandboxCommand::Ls) => sandbox_ls(&socket_path).await,
        Command::Sandbox(SandboxCommand::Rm { sandbox_id }) => {
            sandbox_rm(&socket_path, sandbox_id).await
        }
        Command::Exec(args) => exec(&socket_path, args).await,
    }
}

/// Runs the Control API and egress gateway until interrupted
/// (`spec.md` §6 "Control API (framed RPC)", §4.6 gateway).
async fn run_serve(socket_path: PathBuf, args: ServeArgs) -> Result<()> {
    let cache_base = args.cache_base.unwrap_or_else(default_cache_dir);
    let run_base = args.run_base.unwrap_or_else(default_run_dir);

    let mut config = CoreConfig::with_base_dirs(cache_base, run_base);
    config.kernel_path = args.kernel;
    config.helper_binary = args.helper_binary;
    config.guest_agent_binary = args.guest_agent_binary;
    if let Some(addr) = args.gateway_addr {
        config.gateway_addr = addr;
    }

    let scope_registry = Arc::new(InMemoryScopeRegistry::new());
    let credential_provider = Arc::new(EnvCredentialProvider::new(
        config.credential_env_vars.clone(),
    ));

    let manager = Arc::new(cleanroom_core::SandboxManager::new(
        config.clone(),
        Box::new(RegistryFetcher::default()),
        Box::new(ExtFsMaterializer),
        Box::new(scope_registry.clone()),
    )?);

    let gateway_addr = config.gateway_addr.parse().context("invalid gateway_addr")?;
    let gateway = Gateway::new(gateway_addr, scope_registry, credential_provider);
    let gateway_task = tokio::spawn(async move {
        if let Err(err) = gateway.serve().await {
            tracing::error!(%err, "gateway exited");
        }
    });

    let api = cleanroom_api::ControlApi::new(manager);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    };
    cleanroom_api::serve(api, &socket_path, shutdown).await?;

    gateway_task.abort();
    Ok(())
}

async fn sandbox_create(socket_path: &PathBuf, args: SandboxCreateArgs) -> Result<()> {
    let channel = client::connect(socket_path).await?;
    let mut client = SandboxServiceClient::new(channel);
    let response = client
        .create_sandbox(CreateSandboxRequest {
            backend: args.backend,
            options: Some(SandboxOptions {
                launch_seconds: args.launch_seconds,
                vcpus: args.vcpus,
                memory_mib: args.memory_mib,
                guest_port: 0,
            }),
            policy: Some(Policy {
                version: 1,
                image_ref: args.image,
                network_default: "deny".to_owned(),
                allow: args.allow,
            }),
        })
        .await?
        .into_inner();
    println!("{}", serde_json::to_string_pretty(&sandbox_json(&response))?);
    Ok(())
}

async fn sandbox_ls(socket_path: &PathBuf) -> Result<()> {
    let channel = client::connect(socket_path).await?;
    let mut client = SandboxServiceClient::new(channel);
    let response = client
        .list_sandboxes(ListSandboxesRequest {})
        .await?
        .into_inner();
    let sandboxes: Vec<_> = response.sandboxes.iter().map(sandbox_json).collect();
    println!("{}", serde_json::to_string_pretty(&sandboxes)?);
    Ok(())
}

async fn sandbox_rm(socket_path: &PathBuf, sandbox_id: String) -> Result<()> {
    let channel = client::connect(socket_path).await?;
    let mut client = SandboxServiceClient::new(channel);
    let response = client
        .terminate_sandbox(TerminateSandboxRequest { sandbox_id })
        .await?
        .into_inner();
    println!("{}", response.message);
    Ok(())
}

/// Looks up a sandbox by id, used to validate `exec`'s target before
/// issuing `CreateExecution` so a typo fails fast with a clear message.
async fn ensure_sandbox_exists(
    client: &mut SandboxServiceClient<tonic::transport::Channel>,
    sandbox_id: &str,
) -> Result<()> {
    client
        .get_sandbox(GetSandboxRequest {
            sandbox_id: sandbox_id.to_owned(),
        })
        .await
        .with_context(|| format!("sandbox {sandbox_id} not found"))?;
    Ok(())
}

async fn exec(socket_path: &PathBuf, args: ExecArgs) -> Result<()> {
    let channel = client::connect(socket_path).await?;
    let mut sandbox_client = SandboxServiceClient::new(channel.clone());
    ensure_sandbox_exists(&mut sandbox_client, &args.sandbox_id).await?;

    let mut execution_client = ExecutionServiceClient::new(channel);
    let execution = execution_client
        .create_execution(CreateExecutionRequest {
            sandbox_id: args.sandbox_id.clone(),
            command: args.command,
            options: Some(ExecutionOptions {
                tty: args.tty,
                launch_seconds: 0,
            }),
        })
        .await?
        .into_inner();

    let mut stream = execution_client
        .stream_execution(StreamExecutionRequest {
            sandbox_id: args.sandbox_id.clone(),
            execution_id: execution.execution_id.clone(),
            follow: true,
        })
        .await?
        .into_inner();

    // A first Ctrl-C requests a graceful SIGINT cancel; a second escalates
    // to SIGKILL, mirroring the execution table's own first/second-cancel
    // contract (`spec.md` §4.5).
    let mut cancel_client = execution_client.clone();
    let cancel_sandbox_id = args.sandbox_id.clone();
    let cancel_execution_id = execution.execution_id.clone();
    let cancel_task = tokio::spawn(async move {
        let mut signal = cleanroom_proto::Signal::SIGINT;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let _ = cancel_client
                .cancel_execution(CancelExecutionRequest {
                    sandbox_id: cancel_sandbox_id.clone(),
                    execution_id: cancel_execution_id.clone(),
                    signal,
                })
                .await;
            signal = cleanroom_proto::Signal::SIGKILL;
        }
    });

    let mut exit_code = 0i32;
    while let Some(event) = stream.next().await {
        let event = event?;
        match event.kind {
            Some(execution_event::Kind::Stdout(bytes)) => {
                use std::io::Write as _;
                std::io::stdout().write_all(&bytes)?;
            }
            Some(execution_event::Kind::Stderr(bytes)) => {
                use std::io::Write as _;
                std::io::stderr().write_all(&bytes)?;
            }
            Some(execution_event::Kind::Exit(exit)) => {
                exit_code = exit.exit_code;
                if !exit.message.is_empty() {
                    eprintln!("{}", exit.message);
                }
            }
            None => {}
        }
    }
    cancel_task.abort();

    if exit_code != 0 {
        // Propagate the guest's exit status as this process's own, matching
        // how an interactive shell reports a failed command.
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Renders a `pb::Sandbox` as the operator-facing JSON shape.
fn sandbox_json(sandbox: &cleanroom_api::pb::Sandbox) -> serde_json::Value {
    serde_json::json!({
        "sandbox_id": sandbox.sandbox_id,
        "backend": sandbox.backend,
        "status": sandbox.status,
        "created_at_unix_ms": sandbox.created_at_unix_ms,
        "failure": sandbox.failure,
    })
}
