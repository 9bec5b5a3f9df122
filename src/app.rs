use std::io;
use std::sync::Arc;

use anyhow::Result;
use tracing::instrument;

use crate::cli::{Command, FakeArgs, LogLevel, Renderer, RunOptions};
use crate::controller::SessionController;
use crate::hw::{BtleplugTransport, FakeTransport, Transport};
use crate::permission::{PermissionProvider, SystemPermissions};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

/// Radio and permission collaborators injected into a run.
#[derive(Debug, Clone)]
pub struct Clients {
    transport: Arc<dyn Transport>,
    permissions: Arc<dyn PermissionProvider>,
}

impl Clients {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, permissions: Arc<dyn PermissionProvider>) -> Self {
        Self {
            transport,
            permissions,
        }
    }
}

/// Creates clients backed by the system BLE stack.
///
/// # Errors
///
/// Returns an error if no BLE adapter is available.
pub async fn real_clients() -> Result<Clients> {
    let transport = BtleplugTransport::new().await?;
    Ok(Clients::new(Arc::new(transport), Arc::new(SystemPermissions)))
}

/// Creates clients backed by fake BLE fixtures.
#[must_use]
pub fn fake_clients(fake_args: FakeArgs) -> Clients {
    let (config, permissions) = fake_args.into_parts();
    Clients::new(
        Arc::new(FakeTransport::new(config)),
        Arc::new(permissions),
    )
}

/// Runs the CLI command against the real terminal.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = boxsync::Args::try_parse_from([
///     "boxsync",
///     "--fake",
///     "--fake-scan",
///     "AA:BB:CC|BLEExample|-43",
///     "read",
/// ])?;
/// let options = args.run_options(boxsync::OutputFormat::Json);
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let clients = match maybe_fake_args {
///     Some(fake_args) => boxsync::fake_clients(fake_args),
///     None => boxsync::real_clients().await?,
/// };
/// let mut out = Vec::new();
/// boxsync::run(command, &options, &mut out, clients).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the connect pipeline
/// fails, or output writing fails.
pub async fn run<W>(command: Command, options: &RunOptions, out: &mut W, clients: Clients) -> Result<()>
where
    W: io::Write,
{
    run_with_clients(command, options, out, &SystemTerminalClient, clients).await
}

/// Runs the CLI command with injected clients.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the connect pipeline
/// fails, or output writing fails.
#[instrument(
    skip(options, out, terminal_client, clients),
    level = "info",
    fields(command = %command_name(&command), log_level = ?options.log_level())
)]
pub async fn run_with_clients<W>(
    command: Command,
    options: &RunOptions,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    clients: Clients,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "boxsync",
        terminal_client.stderr_is_terminal(),
        options.log_level().map(LogLevel::as_level_filter),
    )?;

    let controller = SessionController::new(
        clients.transport,
        clients.permissions,
        options.controller().clone(),
    );
    let renderer = Renderer::new(options.output_format(), terminal_client.stdout_is_terminal());

    match command {
        Command::Read => crate::cli::read::run(&controller, &renderer, out).await,
        Command::Watch(args) => crate::cli::watch::run(&controller, &args, &renderer, out).await,
        Command::SetBox(args) => crate::cli::set_box::run(&controller, &args, &renderer, out).await,
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Read => "read",
        Command::Watch(_args) => "watch",
        Command::SetBox(_args) => "set-box",
    }
}
