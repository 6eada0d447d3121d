use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::model::{parse_range, BinAxis, RowLabel, Table};
use crate::error::FormatError;

// ---------------------------------------------------------------------------
// Format description
// ---------------------------------------------------------------------------

/// Field separator of a published table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    /// `;`-separated CSV (HEPData style exports).
    #[default]
    Semicolon,
    Comma,
    /// `|`-delimited text tables.
    Pipe,
    /// Runs of spaces / tabs, as in plain matrix dumps.
    Whitespace,
}

impl Delimiter {
    fn byte(self) -> Option<u8> {
        match self {
            Delimiter::Semicolon => Some(b';'),
            Delimiter::Comma => Some(b','),
            Delimiter::Pipe => Some(b'|'),
            Delimiter::Whitespace => None,
        }
    }
}

/// How to split a text table into rows of `label + numeric fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableFormat {
    pub delimiter: Delimiter,
    /// Leading lines skipped unconditionally.
    pub header_lines: usize,
    /// Lines starting with this character are ignored.
    pub comment: Option<char>,
    /// Whether the first column is a label (bin range, index, index pair).
    pub label: bool,
    /// Expected number of numeric fields after the label; `None` accepts any.
    pub fields: Option<usize>,
    /// Treat a data row with the wrong field count as an error instead of skipping it.
    pub strict: bool,
    /// Accept `"low - high"` cells in numeric columns; their value is the midpoint.
    pub range_cells: bool,
    /// Read only one titled block of a multi-table file.
    pub section: Option<Section>,
}

/// A titled block inside a file holding several tables, such as a HEPData
/// export with the measurement followed by its covariances.
///
/// The block starts `skip` lines after the first line containing every
/// `title` substring (leading blank lines are ignored) and ends at the next
/// blank line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub title: Vec<String>,
    #[serde(default)]
    pub skip: usize,
}

impl Default for TableFormat {
    fn default() -> Self {
        Self {
            delimiter: Delimiter::Semicolon,
            header_lines: 0,
            comment: Some('#'),
            label: true,
            fields: None,
            strict: false,
            range_cells: false,
            section: None,
        }
    }
}

/// One parsed data row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// 1-based line number in the source.
    pub line: usize,
    pub label: Option<RowLabel>,
    pub values: Vec<f64>,
    /// Per numeric field, the range it was read from (only with `range_cells`).
    pub ranges: Vec<Option<(f64, f64)>>,
}

impl Row {
    pub fn range(&self, field: usize) -> Option<(f64, f64)> {
        self.ranges.get(field).copied().flatten()
    }
}

// ---------------------------------------------------------------------------
// Lazy row iterator
// ---------------------------------------------------------------------------

enum RecordSource<R: Read> {
    Delimited(csv::StringRecordsIntoIter<R>),
    Whitespace {
        lines: std::io::Lines<BufReader<R>>,
        line: usize,
    },
}

impl<R: Read> RecordSource<R> {
    /// Next raw record as `(line, fields)`.
    fn next_record(&mut self) -> Option<Result<(usize, Vec<String>), FormatError>> {
        match self {
            RecordSource::Delimited(records) => {
                let result = records.next()?;
                Some(
                    result
                        .map(|record| {
                            let line = record.position().map_or(0, |p| p.line() as usize);
                            (line, record.iter().map(str::to_string).collect())
                        })
                        .map_err(|e| FormatError::Read {
                            line: e.position().map_or(0, |p| p.line() as usize),
                            message: e.to_string(),
                        }),
                )
            }
            RecordSource::Whitespace { lines, line } => {
                let text = lines.next()?;
                *line += 1;
                let line = *line;
                Some(
                    text.map(|t| (line, t.split_whitespace().map(str::to_string).collect()))
                        .map_err(|e| FormatError::Read {
                            line,
                            message: e.to_string(),
                        }),
                )
            }
        }
    }
}

/// The whole stream, or the lines of one [`Section`] read ahead of parsing.
enum Input<R> {
    Whole(R),
    Section(Cursor<Vec<u8>>),
}

impl<R: Read> Read for Input<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Input::Whole(reader) => reader.read(buf),
            Input::Section(cursor) => cursor.read(buf),
        }
    }
}

/// Cut the lines of `section` out of `reader`, with the number of lines before it.
fn select_section<R: Read>(reader: R, section: &Section) -> Result<(String, usize), FormatError> {
    let mut lines = Vec::new();
    for (i, line) in BufReader::new(reader).lines().enumerate() {
        lines.push(line.map_err(|e| FormatError::Read {
            line: i + 1,
            message: e.to_string(),
        })?);
    }
    let title = lines
        .iter()
        .position(|l| section.title.iter().all(|t| l.contains(t.as_str())))
        .ok_or_else(|| FormatError::SectionNotFound {
            title: section.title.clone(),
        })?;
    debug!("section {:?} found at line {}", section.title, title + 1);

    let mut start = (title + 1 + section.skip).min(lines.len());
    while start < lines.len() && lines[start].trim().is_empty() {
        start += 1;
    }
    let end = lines[start..]
        .iter()
        .position(|l| l.trim().is_empty())
        .map_or(lines.len(), |p| start + p);

    let mut text = String::new();
    for line in &lines[start..end] {
        text.push_str(line);
        text.push('\n');
    }
    Ok((text, start))
}

/// Lazily yields data rows, skipping blank, header and comment lines.
pub struct Rows<R: Read> {
    source: RecordSource<Input<R>>,
    format: TableFormat,
    /// Lines preceding the parsed region.
    line_offset: usize,
    /// Reported before any row when the section could not be selected.
    pending: Option<FormatError>,
}

/// Start reading rows from any byte stream.
pub fn rows<R: Read>(reader: R, format: &TableFormat) -> Rows<R> {
    let (input, line_offset, pending) = match &format.section {
        None => (Input::Whole(reader), 0, None),
        Some(section) => match select_section(reader, section) {
            Ok((text, offset)) => (Input::Section(Cursor::new(text.into_bytes())), offset, None),
            Err(e) => (Input::Section(Cursor::default()), 0, Some(e)),
        },
    };
    let source = match format.delimiter.byte() {
        Some(delimiter) => {
            let mut builder = csv::ReaderBuilder::new();
            builder
                .delimiter(delimiter)
                .has_headers(false)
                .flexible(true)
                .trim(csv::Trim::All);
            if let Some(c) = format.comment.filter(char::is_ascii) {
                builder.comment(Some(c as u8));
            }
            RecordSource::Delimited(builder.from_reader(input).into_records())
        }
        None => RecordSource::Whitespace {
            lines: BufReader::new(input).lines(),
            line: 0,
        },
    };
    Rows {
        source,
        format: format.clone(),
        line_offset,
        pending,
    }
}

/// Open a file and read its rows lazily.
pub fn open_rows(path: &Path, format: &TableFormat) -> Result<Rows<File>> {
    let file =
        File::open(path).with_context(|| format!("opening table {}", path.display()))?;
    Ok(rows(file, format))
}

/// Read every row of a file.
pub fn read_rows(path: &Path, format: &TableFormat) -> Result<Vec<Row>> {
    open_rows(path, format)?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing {}", path.display()))
}

impl<R: Read> Iterator for Rows<R> {
    type Item = Result<Row, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending.take() {
            return Some(Err(e));
        }
        loop {
            let (line, fields) = match self.source.next_record()? {
                Ok(record) => record,
                Err(FormatError::Read { line, message }) => {
                    return Some(Err(FormatError::Read {
                        line: line + self.line_offset,
                        message,
                    }))
                }
                Err(e) => return Some(Err(e)),
            };
            if let Some(result) = self.classify(line, fields) {
                return Some(result);
            }
        }
    }
}

impl<R: Read> Rows<R> {
    /// `None` for skipped lines, otherwise the parsed row or its error.
    ///
    /// `local` counts from the start of the parsed region.
    fn classify(&self, local: usize, mut fields: Vec<String>) -> Option<Result<Row, FormatError>> {
        if local <= self.format.header_lines {
            return None;
        }
        let line = local + self.line_offset;
        while fields.last().is_some_and(|f| f.is_empty()) {
            fields.pop();
        }
        if self.format.delimiter == Delimiter::Pipe && fields.first().is_some_and(|f| f.is_empty()) {
            fields.remove(0);
        }
        let first = fields.first()?;
        if let Some(c) = self.format.comment {
            if first.starts_with(c) {
                return None;
            }
        }

        let (label, numeric) = if self.format.label {
            (Some(fields[0].as_str()), &fields[1..])
        } else {
            (None, &fields[..])
        };

        let parsed: Vec<Option<Cell>> = numeric
            .iter()
            .map(|t| parse_cell(t, self.format.range_cells))
            .collect();
        let header_like = parsed.iter().all(Option::is_none);

        if let Some(expected) = self.format.fields {
            if numeric.len() != expected {
                if self.format.strict && !header_like {
                    return Some(Err(FormatError::FieldCount {
                        line,
                        expected,
                        found: numeric.len(),
                    }));
                }
                if header_like {
                    debug!("line {line}: skipping header");
                } else {
                    warn!(
                        "line {line}: skipping row with {} fields (expected {expected})",
                        numeric.len()
                    );
                }
                return None;
            }
        }

        if header_like {
            debug!("line {line}: skipping header");
            return None;
        }

        let offset = usize::from(self.format.label);
        let mut values = Vec::with_capacity(parsed.len());
        let mut ranges = Vec::new();
        for (j, (cell, token)) in parsed.into_iter().zip(numeric).enumerate() {
            match cell {
                Some(Cell::Number(v)) => {
                    values.push(v);
                    if self.format.range_cells {
                        ranges.push(None);
                    }
                }
                Some(Cell::Range(lo, hi)) => {
                    values.push(0.5 * (lo + hi));
                    ranges.push(Some((lo, hi)));
                }
                None => {
                    return Some(Err(FormatError::InvalidNumber {
                        line,
                        field: j + offset + 1,
                        token: token.clone(),
                    }))
                }
            }
        }

        Some(Ok(Row {
            line,
            label: label.map(RowLabel::guess),
            values,
            ranges,
        }))
    }
}

enum Cell {
    Number(f64),
    Range(f64, f64),
}

fn parse_cell(token: &str, range_cells: bool) -> Option<Cell> {
    if let Some(v) = parse_number(token) {
        return Some(Cell::Number(v));
    }
    if range_cells {
        return parse_range(token).map(|(lo, hi)| Cell::Range(lo, hi));
    }
    None
}

/// Parse one numeric cell. Embedded spaces and a trailing `%` are tolerated.
fn parse_number(token: &str) -> Option<f64> {
    let t = token.trim().trim_end_matches('%');
    if t.is_empty() {
        return None;
    }
    if t.contains(' ') {
        let joined = t.replace(' ', "");
        let v = joined.parse().ok()?;
        debug!("read '{t}' as {joined}");
        return Some(v);
    }
    t.parse().ok()
}

// ---------------------------------------------------------------------------
// Rows → Table
// ---------------------------------------------------------------------------

/// Where bin edges, values and uncertainties sit in each row.
///
/// Field positions index the numeric fields after the label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableLayout {
    /// Label is `"low-high"`.
    RangeLabel { value: usize, uncertainty: usize },
    /// Low and high edges are numeric fields.
    EdgeColumns {
        low: usize,
        high: usize,
        value: usize,
        uncertainty: usize,
    },
    /// `x` is the bin's low edge; the last row only closes the axis.
    LowEdgePoints {
        x: usize,
        value: usize,
        uncertainty: usize,
    },
}

/// How the uncertainty column is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UncertaintyKind {
    #[default]
    Absolute,
    /// Relative to the value, in percent.
    Percent,
    /// Relative to the value, as a fraction.
    Fraction,
}

/// Full description of a measurement table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    #[serde(default)]
    pub format: TableFormat,
    pub layout: TableLayout,
    /// Unit conversion applied to values and uncertainties.
    #[serde(default = "unit_scale")]
    pub scale: f64,
    #[serde(default)]
    pub uncertainty: UncertaintyKind,
    /// Values tabulated per this bin width are rescaled by `width / reference_width`.
    #[serde(default)]
    pub reference_width: Option<f64>,
}

fn unit_scale() -> f64 {
    1.0
}

impl TableSpec {
    pub fn new(format: TableFormat, layout: TableLayout) -> Self {
        Self {
            format,
            layout,
            scale: 1.0,
            uncertainty: UncertaintyKind::Absolute,
            reference_width: None,
        }
    }
}

fn field(row: &Row, index: usize) -> Result<f64, FormatError> {
    row.values.get(index).copied().ok_or(FormatError::FieldCount {
        line: row.line,
        expected: index + 1,
        found: row.values.len(),
    })
}

fn row_range(row: &Row) -> Result<(f64, f64), FormatError> {
    let label = row
        .label
        .as_ref()
        .ok_or(FormatError::MissingLabel { line: row.line })?;
    label.as_range().ok_or_else(|| FormatError::BadLabel {
        line: row.line,
        label: label.to_string(),
        expected: "a bin range",
    })
}

/// Assemble a [`Table`] from parsed rows.
pub fn build_table<I>(rows: I, spec: &TableSpec) -> Result<Table, FormatError>
where
    I: IntoIterator<Item = Result<Row, FormatError>>,
{
    let rows = rows.into_iter().collect::<Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        return Err(FormatError::NoRows);
    }

    let mut values = Vec::with_capacity(rows.len());
    let mut errors = Vec::with_capacity(rows.len());

    let axis = match spec.layout {
        TableLayout::RangeLabel { value, uncertainty } => {
            let mut ranges = Vec::with_capacity(rows.len());
            for row in &rows {
                ranges.push(row_range(row)?);
                values.push(field(row, value)?);
                errors.push(field(row, uncertainty)?);
            }
            BinAxis::from_ranges(&ranges)?
        }
        TableLayout::EdgeColumns {
            low,
            high,
            value,
            uncertainty,
        } => {
            let mut ranges = Vec::with_capacity(rows.len());
            for row in &rows {
                ranges.push((field(row, low)?, field(row, high)?));
                values.push(field(row, value)?);
                errors.push(field(row, uncertainty)?);
            }
            BinAxis::from_ranges(&ranges)?
        }
        TableLayout::LowEdgePoints {
            x,
            value,
            uncertainty,
        } => {
            let mut edges = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                edges.push(field(row, x)?);
                if i + 1 < rows.len() {
                    values.push(field(row, value)?);
                    errors.push(field(row, uncertainty)?);
                }
            }
            BinAxis::new(edges)?
        }
    };

    for (i, (v, e)) in values.iter_mut().zip(errors.iter_mut()).enumerate() {
        *e = match spec.uncertainty {
            UncertaintyKind::Absolute => *e,
            UncertaintyKind::Percent => v.abs() * *e / 100.0,
            UncertaintyKind::Fraction => v.abs() * *e,
        };
        let mut factor = spec.scale;
        if let Some(reference) = spec.reference_width {
            factor *= axis.width(i) / reference;
        }
        *v *= factor;
        *e *= factor;
    }

    Table::new(axis, values, errors)
}

/// Read and assemble a table file.
pub fn load_table(path: &Path, spec: &TableSpec) -> Result<Table> {
    let rows = open_rows(path, &spec.format)?;
    build_table(rows, spec).with_context(|| format!("reading table {}", path.display()))
}
