use std::fmt::{self, Display, Formatter};

use crate::session::{ObservedValue, SessionSnapshot};

use super::device_view::DeviceView;
use super::painter::Painter;
use super::table::Table;

/// Renders the published session state with both observed values.
pub(crate) struct SnapshotView<'a> {
    snapshot: &'a SessionSnapshot,
    painter: &'a Painter,
}

impl<'a> SnapshotView<'a> {
    pub(crate) fn new(snapshot: &'a SessionSnapshot, painter: &'a Painter) -> Self {
        Self { snapshot, painter }
    }

    fn observed<T: Display>(&self, observed: &ObservedValue<T>) -> String {
        format!(
            "{} {}",
            self.painter.value(observed.value().to_string()),
            self.painter.muted(format!("(rev {})", observed.revision()))
        )
    }
}

impl Display for SnapshotView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(device) = self.snapshot.device() {
            writeln!(f, "{}", self.painter.heading("Device"))?;
            writeln!(f, "{}", DeviceView::new(device, self.painter))?;
        }

        let connected = self.snapshot.connection_status();
        let mut rows = vec![
            ("state", self.painter.value(self.snapshot.state().to_string())),
            (
                "connected",
                self.painter
                    .flag(connected, if connected { "yes" } else { "no" }),
            ),
            ("message", self.observed(self.snapshot.message())),
            ("box", self.observed(self.snapshot.box_value())),
        ];
        for handle in self.snapshot.handles() {
            let observing = handle
                .subscription()
                .map_or_else(|| self.painter.muted("not observed"), |name| self.painter.value(name));
            rows.push((
                "observing",
                format!(
                    "{} {}",
                    observing,
                    self.painter.muted(format!("({})", handle.characteristic().uuid()))
                ),
            ));
        }

        writeln!(f, "{}", self.painter.heading("Session"))?;
        write!(f, "{}", Table::key_value(self.painter, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_snapshot_shows_defaults_without_device() {
        let snapshot = SessionSnapshot::default();
        let painter = Painter::new(false);

        let rendered = SnapshotView::new(&snapshot, &painter).to_string();

        assert!(!rendered.contains("Device"));
        assert!(rendered.contains("idle"));
        assert!(rendered.contains("Nothing Yet (rev 0)"));
        assert!(rendered.contains("off (rev 0)"));
    }
}
