use std::fmt::{self, Display, Formatter};

use tabled::{builder::Builder, settings::Style as TableStyle};

use super::painter::Painter;

/// A two-column field/value table that renders via `Display`.
#[derive(Debug)]
pub(crate) struct Table {
    rows: Vec<[String; 2]>,
}

impl Table {
    /// Field names are muted; values are rendered as given.
    pub(crate) fn key_value(painter: &Painter, rows: Vec<(&str, String)>) -> Self {
        Self {
            rows: rows
                .into_iter()
                .map(|(field, value)| [painter.muted(field), value])
                .collect(),
        }
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut builder = Builder::default();
        builder.push_record(["field", "value"]);
        for row in &self.rows {
            builder.push_record(row);
        }
        let mut table = builder.build();
        table.with(TableStyle::rounded());
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_table_lists_each_row_once() {
        let painter = Painter::new(false);
        let rendered = Table::key_value(
            &painter,
            vec![("state", "connected".into()), ("message", "Hello".into())],
        )
        .to_string();

        assert!(rendered.starts_with('╭'));
        assert_eq!(1, rendered.matches("connected").count());
        assert_eq!(1, rendered.matches("Hello").count());
        assert!(rendered.lines().any(|line| line.contains("field") && line.contains("value")));
    }
}
