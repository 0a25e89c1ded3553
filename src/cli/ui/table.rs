use std::fmt::{self, Display, Formatter};

use tabled::builder::Builder;
use tabled::settings::object::Columns;
use tabled::settings::{Alignment, Style};

use super::painter::Painter;

/// Report rows under one header row, drawn with rounded borders.
#[derive(Debug)]
pub(crate) struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    numbered: bool,
}

impl Table {
    pub(crate) fn with_header<const N: usize>(header: [&str; N]) -> Self {
        Self {
            header: header.iter().map(|column| (*column).to_owned()).collect(),
            rows: Vec::new(),
            numbered: false,
        }
    }

    /// Two columns of component or config fields and their values.
    pub(crate) fn fields<'a>(
        painter: &Painter,
        fields: impl IntoIterator<Item = (&'a str, String)>,
    ) -> Self {
        let mut table = Self::with_header(["field", "value"]);
        for (field, value) in fields {
            table.push(vec![painter.label(field), value]);
        }
        table
    }

    /// Right-aligns the first column, which holds row numbers.
    pub(crate) fn numbered(mut self) -> Self {
        self.numbered = true;
        self
    }

    pub(crate) fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut builder = Builder::default();
        builder.push_record(self.header.iter().cloned());
        for row in &self.rows {
            builder.push_record(row.iter().cloned());
        }
        let mut table = builder.build();
        table.with(Style::rounded());
        if self.numbered {
            table.modify(Columns::first(), Alignment::right());
        }
        write!(f, "{table}")
    }
}
