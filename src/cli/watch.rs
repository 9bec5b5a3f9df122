use std::io;

use anyhow::Result;
use clap::Args;
use tokio::sync::watch;
use tracing::info;

use super::Renderer;
use super::ui::UpdateView;
use crate::controller::SessionController;
use crate::session::{SessionSnapshot, SessionState};

/// Arguments for the `watch` command.
#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Stop after this many value changes. If omitted, watch until Ctrl+C or a disconnect.
    #[arg(long)]
    max_updates: Option<usize>,
}

impl WatchArgs {
    #[must_use]
    pub fn new(max_updates: Option<usize>) -> Self {
        Self { max_updates }
    }
}

#[derive(Debug, Clone, Copy, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
enum StopReason {
    Limit,
    Interrupted,
    PeripheralDisconnected,
    SessionClosed,
}

/// Executes the `watch` command.
pub(crate) async fn run<W>(
    controller: &SessionController,
    args: &WatchArgs,
    renderer: &Renderer,
    out: &mut W,
) -> Result<()>
where
    W: io::Write,
{
    super::connect(controller).await?;
    let mut updates = controller.watch();
    let snapshot = updates.borrow_and_update().clone();

    let followed = match renderer.snapshot(out, &snapshot) {
        Ok(()) => follow(&mut updates, snapshot, args.max_updates, renderer, out).await,
        Err(error) => Err(error),
    };
    controller.request_disconnect().await?;

    let (received, reason) = followed?;
    info!(received, %reason, "stopped watching");
    writeln!(
        out,
        "{}",
        renderer
            .painter()
            .muted(format!("stopped after {received} update(s): {reason}"))
    )?;
    Ok(())
}

async fn follow<W>(
    updates: &mut watch::Receiver<SessionSnapshot>,
    mut previous: SessionSnapshot,
    max_updates: Option<usize>,
    renderer: &Renderer,
    out: &mut W,
) -> Result<(usize, StopReason)>
where
    W: io::Write,
{
    let mut received: usize = 0;
    loop {
        if max_updates.is_some_and(|limit| received >= limit) {
            return Ok((received, StopReason::Limit));
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok((received, StopReason::SessionClosed));
                }
                let current = updates.borrow_and_update().clone();
                if UpdateView::new(&previous, &current, renderer.painter()).has_value_change() {
                    // Coalesced publications still count every accepted value.
                    let advanced = current.total_revision().saturating_sub(previous.total_revision());
                    received = received.saturating_add(usize::try_from(advanced).unwrap_or(usize::MAX));
                    renderer.update(out, &previous, &current)?;
                }
                if current.state() == SessionState::Idle && !current.connection_status() {
                    return Ok((received, StopReason::PeripheralDisconnected));
                }
                previous = current;
            }
            _ = tokio::signal::ctrl_c() => return Ok((received, StopReason::Interrupted)),
        }
    }
}
