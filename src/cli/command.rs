use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::LevelFilter;

use crate::cli::set_box::SetBoxArgs;
use crate::cli::watch::WatchArgs;
use crate::codec::BoxState;
use crate::controller::ControllerConfig;
use crate::error::{CliConfigError, FixtureError};
use crate::hw::{self, FakeTransportConfig, FakeUpdates, ScanFixture};
use crate::permission::{FixedPermissions, PermissionStatus, RequestOutcome};
use crate::protocol::DEFAULT_DEVICE_NAME;
use crate::session::SessionConfig;

/// Command-line options for the box synchronisation tool.
#[derive(Debug, Parser)]
#[command(
    name = "boxsync",
    about = "Connect to a BLE peripheral and keep its message and box values in sync."
)]
pub struct Args {
    /// Advertised name of the peripheral to connect to.
    #[arg(long, global = true, default_value = DEFAULT_DEVICE_NAME)]
    device_name: String,
    /// How long to scan before giving up (e.g. `5s`, `1500ms`).
    #[arg(long, global = true, value_parser = parse_duration, default_value = "5s")]
    scan_timeout: Duration,
    /// Bound on opening the link and discovering services.
    #[arg(long, global = true, value_parser = parse_duration, default_value = "10s")]
    connect_timeout: Duration,
    /// Overrides `RUST_LOG` for this run.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format; defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    output_format: Option<OutputFormat>,
    /// Uses the fake BLE backend with fixture-driven discovery and values.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake scan fixtures in the form `device_id|local_name|rssi;...` (`-` for none).
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_scan: Option<ScanFixture>,
    /// Initial fake message value.
    #[arg(long, global = true, requires = "fake")]
    fake_message: Option<String>,
    /// Initial fake box value (`on`, `off`, `1` or `0`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_box_value)]
    fake_box: Option<BoxState>,
    /// Scripted pushes, e.g. `message:Hi,box:1,hex:box:`.
    #[arg(long, global = true, requires = "fake")]
    fake_updates: Option<FakeUpdates>,
    /// Permission status the fake platform reports.
    #[arg(long, global = true, requires = "fake", value_enum)]
    fake_permission: Option<PermissionStatus>,
    /// Artificial delay before the fake peripheral advertises.
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_advertise_delay: Option<Duration>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Log-level override requested on the command line.
    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Output format requested on the command line.
    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output_format
    }

    /// Run options assembled from the global flags, with `output_format` as the fallback format.
    #[must_use]
    pub fn run_options(&self, output_format: OutputFormat) -> RunOptions {
        RunOptions::builder()
            .controller(self.controller_config())
            .output_format(self.output_format.unwrap_or(output_format))
            .maybe_log_level(self.log_level)
            .build()
    }

    /// Controller settings assembled from the global flags.
    #[must_use]
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::builder()
            .device_name(self.device_name.clone())
            .scan_timeout(self.scan_timeout)
            .session(
                SessionConfig::builder()
                    .connect_timeout(self.connect_timeout)
                    .build(),
            )
            .build()
    }

    /// Splits parsed CLI arguments into command and optional fake-client settings.
    ///
    /// # Errors
    ///
    /// Returns an error if CLI backend configuration is invalid.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            fake,
            fake_scan,
            fake_message,
            fake_box,
            fake_updates,
            fake_permission,
            fake_advertise_delay,
            command,
            ..
        } = self;

        if !fake {
            return Ok((command, None));
        }
        let Some(scan_fixture) = fake_scan else {
            return Err(CliConfigError::MissingFakeScanFixture.into());
        };
        let fake_args = FakeArgs {
            scan_fixture,
            message: fake_message,
            box_value: fake_box,
            updates: fake_updates.unwrap_or_default(),
            permission: fake_permission.unwrap_or(PermissionStatus::Granted),
            advertise_delay: fake_advertise_delay.unwrap_or(Duration::ZERO),
        };

        Ok((command, Some(fake_args)))
    }
}

/// Fake backend arguments for programmatic runs.
#[derive(Debug, Clone, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    scan_fixture: ScanFixture,
    #[builder(into)]
    message: Option<String>,
    box_value: Option<BoxState>,
    #[builder(default)]
    updates: FakeUpdates,
    #[builder(default = PermissionStatus::Granted)]
    permission: PermissionStatus,
    #[builder(default)]
    advertise_delay: Duration,
}

impl FakeArgs {
    pub(crate) fn into_parts(self) -> (FakeTransportConfig, FixedPermissions) {
        let Self {
            scan_fixture,
            message,
            box_value,
            updates,
            permission,
            advertise_delay,
        } = self;

        let config = FakeTransportConfig::builder()
            .scan_fixture(scan_fixture)
            .maybe_message(message)
            .maybe_box_value(box_value)
            .updates(updates.into())
            .advertise_delay(advertise_delay)
            .build();
        // A denied fake status models a user who accepts the follow-up prompt.
        let permissions = FixedPermissions::new(permission, RequestOutcome::Granted);
        (config, permissions)
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect, print the synchronised values, then disconnect.
    Read,
    /// Connect and print every value change until the limit, Ctrl+C, or a remote disconnect.
    Watch(WatchArgs),
    /// Connect, write the box value, print the acknowledged state, then disconnect.
    SetBox(SetBoxArgs),
}

/// Settings for one CLI run.
#[derive(Debug, Clone, Builder)]
pub struct RunOptions {
    #[builder(default)]
    controller: ControllerConfig,
    #[builder(default)]
    output_format: OutputFormat,
    log_level: Option<LogLevel>,
}

impl RunOptions {
    pub(crate) fn controller(&self) -> &ControllerConfig {
        &self.controller
    }

    pub(crate) fn output_format(&self) -> OutputFormat {
        self.output_format
    }

    pub(crate) fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }
}

/// Verbosity override for diagnostics on stderr.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// How command results are written to stdout.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Key/value tables, coloured on a terminal.
    #[default]
    Pretty,
    /// One JSON document per snapshot.
    Json,
}

pub(crate) fn parse_box_value(value: &str) -> Result<BoxState, FixtureError> {
    hw::parse_box(value)
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}
