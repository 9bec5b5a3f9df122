use std::fmt::{self, Display, Formatter};

use crate::session::SessionSnapshot;

use super::painter::Painter;

/// One line describing what changed between two published snapshots.
pub(crate) struct UpdateView<'a> {
    previous: &'a SessionSnapshot,
    current: &'a SessionSnapshot,
    painter: &'a Painter,
}

impl<'a> UpdateView<'a> {
    pub(crate) fn new(
        previous: &'a SessionSnapshot,
        current: &'a SessionSnapshot,
        painter: &'a Painter,
    ) -> Self {
        Self {
            previous,
            current,
            painter,
        }
    }

    /// Whether either observed value moved.
    pub(crate) fn has_value_change(&self) -> bool {
        self.current.total_revision() != self.previous.total_revision()
    }
}

impl Display for UpdateView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut changes = Vec::new();
        let message = self.current.message();
        if message.revision() != self.previous.message().revision() {
            changes.push(format!(
                "message={} {}",
                self.painter.value(message.value()),
                self.painter.muted(format!("(rev {})", message.revision()))
            ));
        }
        let box_value = self.current.box_value();
        if box_value.revision() != self.previous.box_value().revision() {
            changes.push(format!(
                "box={} {}",
                self.painter.flag(box_value.value().is_on(), box_value.value().to_string()),
                self.painter.muted(format!("(rev {})", box_value.revision()))
            ));
        }
        if self.current.state() != self.previous.state() {
            changes.push(format!(
                "state={}",
                self.painter.value(self.current.state().to_string())
            ));
        }
        write!(f, "{}", changes.join(" "))
    }
}
