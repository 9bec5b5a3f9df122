use std::io;

use anyhow::Result;

use super::Renderer;
use crate::controller::SessionController;

/// Executes the `read` command.
pub(crate) async fn run<W>(controller: &SessionController, renderer: &Renderer, out: &mut W) -> Result<()>
where
    W: io::Write,
{
    let snapshot = super::connect(controller).await?;
    let written = renderer.snapshot(out, &snapshot);
    controller.request_disconnect().await?;
    written
}
