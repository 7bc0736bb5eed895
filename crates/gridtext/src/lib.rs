//! Gridtext - plain text tables.
//!
//! A table is a list of titled columns, each with its own justification,
//! followed by rows of cells. Rendering produces one `String` per output
//! line, optionally framed with ASCII borders and topped with a caption
//! spanning the full width.

/// How a cell's text is placed within its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Justify {
    #[default]
    Left,
    Center,
    Right,
}

impl Justify {
    fn pad(self, text: &str, width: usize) -> String {
        let len = text.chars().count();
        let fill = width.saturating_sub(len);
        let (left, right) = match self {
            Justify::Left => (0, fill),
            Justify::Right => (fill, 0),
            Justify::Center => (fill / 2, fill - fill / 2),
        };
        format!("{}{}{}", " ".repeat(left), text, " ".repeat(right))
    }
}

/// Frame style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Border {
    /// Columns separated by two spaces, no frame.
    None,
    /// `+---+` corners, `|` verticals.
    #[default]
    Ascii,
}

#[derive(Debug, Clone)]
struct Column {
    title: String,
    justify: Justify,
}

#[derive(Debug, Clone)]
enum Row {
    Cells(Vec<String>),
    Separator,
}

/// A text table.
#[derive(Debug, Clone, Default)]
pub struct Table {
    caption: Option<String>,
    columns: Vec<Column>,
    rows: Vec<Row>,
    border: Border,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a caption rendered centered above the column titles.
    pub fn caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    /// Append a column.
    pub fn column(mut self, title: impl Into<String>, justify: Justify) -> Self {
        self.columns.push(Column {
            title: title.into(),
            justify,
        });
        self
    }

    pub fn border(mut self, border: Border) -> Self {
        self.border = border;
        self
    }

    /// Append a row of cells.
    ///
    /// Missing cells render empty; cells beyond the column count are dropped.
    pub fn row<I, S>(&mut self, cells: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cells: Vec<String> = cells.into_iter().map(Into::into).collect();
        cells.resize(self.columns.len(), String::new());
        self.rows.push(Row::Cells(cells));
    }

    /// Append a horizontal rule between rows.
    pub fn separator(&mut self) {
        self.rows.push(Row::Separator);
    }

    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self
            .columns
            .iter()
            .map(|c| c.title.chars().count())
            .collect();
        for row in &self.rows {
            if let Row::Cells(cells) = row {
                for (w, cell) in widths.iter_mut().zip(cells) {
                    *w = (*w).max(cell.chars().count());
                }
            }
        }

        // Widen the last column so the caption fits.
        if let Some(caption) = &self.caption {
            let inner = self.inner_width(&widths);
            let needed = caption.chars().count();
            if needed > inner
                && let Some(last) = widths.last_mut()
            {
                *last += needed - inner;
            }
        }

        widths
    }

    /// Width of the text area between the outer borders.
    fn inner_width(&self, widths: &[usize]) -> usize {
        let sum: usize = widths.iter().sum();
        let gaps = widths.len().saturating_sub(1);
        match self.border {
            Border::None => sum + gaps * 2,
            Border::Ascii => sum + widths.len() * 2 + gaps,
        }
        .saturating_sub(match self.border {
            Border::None => 0,
            Border::Ascii => 2,
        })
    }

    fn rule(widths: &[usize]) -> String {
        let mut line = String::from("+");
        for w in widths {
            line.push_str(&"-".repeat(w + 2));
            line.push('+');
        }
        line
    }

    fn line(&self, widths: &[usize], cells: &[(&str, Justify)]) -> String {
        match self.border {
            Border::None => cells
                .iter()
                .zip(widths)
                .map(|((text, justify), w)| justify.pad(text, *w))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string(),
            Border::Ascii => {
                let mut line = String::from("|");
                for ((text, justify), w) in cells.iter().zip(widths) {
                    line.push(' ');
                    line.push_str(&justify.pad(text, *w));
                    line.push_str(" |");
                }
                line
            }
        }
    }

    /// Render the table into lines of text.
    pub fn render(&self) -> Vec<String> {
        if self.columns.is_empty() {
            return Vec::new();
        }

        let widths = self.widths();
        let framed = self.border == Border::Ascii;
        let mut lines = Vec::new();

        if let Some(caption) = &self.caption {
            let inner = self.inner_width(&widths);
            if framed {
                lines.push(format!("+{}+", "-".repeat(inner + 2)));
                lines.push(format!("| {} |", Justify::Center.pad(caption, inner)));
            } else {
                lines.push(Justify::Center.pad(caption, inner).trim_end().to_string());
            }
        }

        let titles: Vec<(&str, Justify)> = self
            .columns
            .iter()
            .map(|c| (c.title.as_str(), Justify::Center))
            .collect();
        if framed {
            lines.push(Self::rule(&widths));
        }
        lines.push(self.line(&widths, &titles));
        if framed {
            lines.push(Self::rule(&widths));
        }

        for row in &self.rows {
            match row {
                Row::Cells(cells) => {
                    let cells: Vec<(&str, Justify)> = cells
                        .iter()
                        .zip(&self.columns)
                        .map(|(text, col)| (text.as_str(), col.justify))
                        .collect();
                    lines.push(self.line(&widths, &cells));
                }
                Row::Separator => {
                    if framed {
                        lines.push(Self::rule(&widths));
                    } else {
                        let total = self.inner_width(&widths);
                        lines.push("-".repeat(total));
                    }
                }
            }
        }

        if framed && !matches!(self.rows.last(), Some(Row::Separator)) {
            lines.push(Self::rule(&widths));
        }

        lines
    }
}
