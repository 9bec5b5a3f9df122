use std::io;

use anyhow::Result;
use clap::Args;
use tracing::debug;

use super::Renderer;
use super::command::parse_box_value;
use crate::codec::BoxState;
use crate::controller::SessionController;

/// Arguments for the `set-box` command.
#[derive(Debug, Args)]
pub struct SetBoxArgs {
    /// Value to write: `on`, `off`, `1` or `0`.
    #[arg(value_parser = parse_box_value)]
    value: BoxState,
}

impl SetBoxArgs {
    #[must_use]
    pub fn new(value: BoxState) -> Self {
        Self { value }
    }
}

/// Executes the `set-box` command.
pub(crate) async fn run<W>(
    controller: &SessionController,
    args: &SetBoxArgs,
    renderer: &Renderer,
    out: &mut W,
) -> Result<()>
where
    W: io::Write,
{
    super::connect(controller).await?;

    let written = match controller.set_box_value(args.value.is_on()).await {
        Ok(acknowledged) => {
            debug!(requested = %args.value, %acknowledged, "write acknowledged");
            renderer.snapshot(out, &controller.snapshot())
        }
        Err(error) => Err(error.into()),
    };
    controller.request_disconnect().await?;
    written
}
