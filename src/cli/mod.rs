pub(crate) mod command;
pub(crate) mod read;
pub(crate) mod set_box;
pub(crate) mod ui;
pub(crate) mod watch;

use std::io;

use anyhow::Result;

pub use self::command::{Args, Command, FakeArgs, LogLevel, OutputFormat, RunOptions};
pub use self::set_box::SetBoxArgs;
pub use self::watch::WatchArgs;

use self::ui::{Painter, SnapshotView, UpdateView};
use crate::controller::SessionController;
use crate::error::RequestConnectError;
use crate::session::SessionSnapshot;

/// Writes snapshots in the selected output format.
pub(crate) struct Renderer {
    format: OutputFormat,
    painter: Painter,
}

impl Renderer {
    pub(crate) fn new(format: OutputFormat, use_colour: bool) -> Self {
        Self {
            format,
            painter: Painter::new(use_colour && format == OutputFormat::Pretty),
        }
    }

    pub(crate) fn snapshot<W: io::Write>(&self, out: &mut W, snapshot: &SessionSnapshot) -> Result<()> {
        match self.format {
            OutputFormat::Pretty => writeln!(out, "{}", SnapshotView::new(snapshot, &self.painter))?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut *out, snapshot)?;
                writeln!(out)?;
            }
        }
        Ok(())
    }

    pub(crate) fn update<W: io::Write>(
        &self,
        out: &mut W,
        previous: &SessionSnapshot,
        current: &SessionSnapshot,
    ) -> Result<()> {
        match self.format {
            OutputFormat::Pretty => writeln!(
                out,
                "{}",
                UpdateView::new(previous, current, &self.painter)
            )?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut *out, current)?;
                writeln!(out)?;
            }
        }
        Ok(())
    }

    pub(crate) fn painter(&self) -> &Painter {
        &self.painter
    }
}

/// Runs the connect pipeline, offering the settings page when access is blocked.
pub(crate) async fn connect(controller: &SessionController) -> Result<SessionSnapshot> {
    match controller.request_connect().await {
        Ok(snapshot) => Ok(snapshot),
        Err(error @ RequestConnectError::SettingsRedirect) => {
            controller.open_settings().await;
            Err(error.into())
        }
        Err(error) => Err(error.into()),
    }
}
