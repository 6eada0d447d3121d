use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use arrow::array::{
    Array, ArrayRef, Float32Array, Float64Array, Float64Builder, LargeListArray, ListArray,
    ListBuilder, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use log::{debug, info};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};

use super::model::{BinAxis, Histogram1D, Histogram2D, Matrix};

// ---------------------------------------------------------------------------
// Stored objects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Hist1d,
    Hist2d,
    Matrix,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Hist1d => "hist1d",
            ObjectKind::Hist2d => "hist2d",
            ObjectKind::Matrix => "matrix",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hist1d" => Some(ObjectKind::Hist1d),
            "hist2d" => Some(ObjectKind::Hist2d),
            "matrix" => Some(ObjectKind::Matrix),
            _ => None,
        }
    }
}

/// One named object in a container, flattened to plain arrays.
///
/// * `hist1d`: `x_edges`, `values` / `errors` per bin, `y_edges` empty.
/// * `hist2d`: both edge arrays, `values` / `errors` x-major.
/// * `matrix`: `x_edges == y_edges` (the bin axis of the rows), `values`
///   row-major, `errors` empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub name: String,
    pub kind: ObjectKind,
    pub title: String,
    pub x_edges: Vec<f64>,
    pub y_edges: Vec<f64>,
    pub values: Vec<f64>,
    pub errors: Vec<f64>,
}

impl From<&Histogram1D> for StoredObject {
    fn from(h: &Histogram1D) -> Self {
        StoredObject {
            name: h.name.clone(),
            kind: ObjectKind::Hist1d,
            title: h.title.clone(),
            x_edges: h.axis.edges().to_vec(),
            y_edges: Vec::new(),
            values: h.contents.clone(),
            errors: h.errors.clone(),
        }
    }
}

impl From<&Histogram2D> for StoredObject {
    fn from(h: &Histogram2D) -> Self {
        StoredObject {
            name: h.name.clone(),
            kind: ObjectKind::Hist2d,
            title: h.title.clone(),
            x_edges: h.x_axis.edges().to_vec(),
            y_edges: h.y_axis.edges().to_vec(),
            values: h.contents.clone(),
            errors: h.errors.clone(),
        }
    }
}

impl StoredObject {
    /// A matrix whose rows and columns follow `axis` (plain indices when `None`).
    pub fn matrix(name: &str, title: &str, m: &Matrix, axis: Option<&BinAxis>) -> Self {
        let edges = match axis {
            Some(a) if a.n_bins() == m.dim() => a.edges().to_vec(),
            _ => BinAxis::indices(m.dim()).edges().to_vec(),
        };
        StoredObject {
            name: name.to_string(),
            kind: ObjectKind::Matrix,
            title: title.to_string(),
            x_edges: edges.clone(),
            y_edges: edges,
            values: m.to_row_major(),
            errors: Vec::new(),
        }
    }

    fn expect_kind(&self, kind: ObjectKind) -> Result<()> {
        if self.kind != kind {
            bail!(
                "object '{}' is a {}, not a {}",
                self.name,
                self.kind.as_str(),
                kind.as_str()
            );
        }
        Ok(())
    }

    pub fn to_histogram1d(&self) -> Result<Histogram1D> {
        self.expect_kind(ObjectKind::Hist1d)?;
        let axis = BinAxis::new(self.x_edges.clone())
            .with_context(|| format!("object '{}'", self.name))?;
        if self.values.len() != axis.n_bins() || self.errors.len() != axis.n_bins() {
            bail!("object '{}': bin count does not match its edges", self.name);
        }
        Ok(Histogram1D {
            name: self.name.clone(),
            title: self.title.clone(),
            axis,
            contents: self.values.clone(),
            errors: self.errors.clone(),
        })
    }

    pub fn to_histogram2d(&self) -> Result<Histogram2D> {
        self.expect_kind(ObjectKind::Hist2d)?;
        let x_axis = BinAxis::new(self.x_edges.clone())
            .with_context(|| format!("object '{}' x axis", self.name))?;
        let y_axis = BinAxis::new(self.y_edges.clone())
            .with_context(|| format!("object '{}' y axis", self.name))?;
        let n = x_axis.n_bins() * y_axis.n_bins();
        if self.values.len() != n || self.errors.len() != n {
            bail!("object '{}': bin count does not match its edges", self.name);
        }
        Ok(Histogram2D {
            name: self.name.clone(),
            title: self.title.clone(),
            x_axis,
            y_axis,
            contents: self.values.clone(),
            errors: self.errors.clone(),
        })
    }

    pub fn to_matrix(&self) -> Result<Matrix> {
        self.expect_kind(ObjectKind::Matrix)?;
        let dim = self.x_edges.len().saturating_sub(1);
        Matrix::from_row_major(dim, &self.values).with_context(|| format!("object '{}'", self.name))
    }
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

/// Named objects in insertion order; names are unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    objects: Vec<StoredObject>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object, replacing (in place) any object with the same name.
    pub fn insert(&mut self, object: StoredObject) -> Option<StoredObject> {
        match self.objects.iter_mut().find(|o| o.name == object.name) {
            Some(slot) => Some(std::mem::replace(slot, object)),
            None => {
                self.objects.push(object);
                None
            }
        }
    }

    pub fn add_histogram(&mut self, h: &Histogram1D) {
        self.insert(h.into());
    }

    pub fn add_histogram2d(&mut self, h: &Histogram2D) {
        self.insert(h.into());
    }

    pub fn add_matrix(&mut self, name: &str, title: &str, m: &Matrix, axis: Option<&BinAxis>) {
        self.insert(StoredObject::matrix(name, title, m, axis));
    }

    pub fn get(&self, name: &str) -> Option<&StoredObject> {
        self.objects.iter().find(|o| o.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.objects.iter().map(|o| o.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredObject> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Write a container, replacing any existing file.  Dispatch by extension.
///
/// Supported formats:
/// * `.parquet` – one row per object with list columns (recommended)
/// * `.json`    – `[{ "name": ..., "kind": ..., "values": [...], ... }, ...]`
pub fn write_container(path: &Path, container: &Container) -> Result<()> {
    match extension(path).as_str() {
        "parquet" | "pq" => write_parquet(path, container),
        "json" => write_json(path, container),
        other => bail!("Unsupported container extension: .{other}"),
    }?;
    info!("wrote {} objects to {}", container.len(), path.display());
    Ok(())
}

/// Read a container written by [`write_container`].
pub fn read_container(path: &Path) -> Result<Container> {
    match extension(path).as_str() {
        "parquet" | "pq" => read_parquet(path),
        "json" => read_json(path),
        other => bail!("Unsupported container extension: .{other}"),
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

impl StoredObject {
    /// First NaN or infinite number held by the object, as `(column, position)`.
    fn non_finite(&self) -> Option<(&'static str, usize)> {
        [
            ("x_edges", &self.x_edges),
            ("y_edges", &self.y_edges),
            ("values", &self.values),
            ("errors", &self.errors),
        ]
        .into_iter()
        .find_map(|(column, data)| {
            data.iter()
                .position(|v| !v.is_finite())
                .map(|i| (column, i))
        })
    }
}

/// Refuses objects holding NaN or infinity, which JSON cannot represent.
fn write_json(path: &Path, container: &Container) -> Result<()> {
    for object in container.iter() {
        if let Some((column, i)) = object.non_finite() {
            bail!(
                "object '{}' has a non-finite number ({column}[{i}]); JSON cannot hold it, write a .parquet container instead",
                object.name
            );
        }
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &container.objects)
        .context("writing JSON container")
}

fn read_json(path: &Path) -> Result<Container> {
    let text = std::fs::read_to_string(path).context("reading JSON container")?;
    let objects: Vec<StoredObject> = serde_json::from_str(&text).context("parsing JSON container")?;
    let mut container = Container::new();
    for object in objects {
        container.insert(object);
    }
    Ok(container)
}

// ---------------------------------------------------------------------------
// Parquet
// ---------------------------------------------------------------------------

fn list_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
        false,
    )
}

fn f64_lists<'a>(rows: impl Iterator<Item = &'a [f64]>) -> ListArray {
    let mut builder = ListBuilder::new(Float64Builder::new());
    for row in rows {
        builder.values().append_slice(row);
        builder.append(true);
    }
    builder.finish()
}

fn write_parquet(path: &Path, container: &Container) -> Result<()> {
    let objects = &container.objects;
    let schema = Arc::new(Schema::new(vec![
        Field::new("name", DataType::Utf8, false),
        Field::new("kind", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        list_field("x_edges"),
        list_field("y_edges"),
        list_field("values"),
        list_field("errors"),
    ]));

    let names = StringArray::from(objects.iter().map(|o| o.name.as_str()).collect::<Vec<_>>());
    let kinds = StringArray::from(objects.iter().map(|o| o.kind.as_str()).collect::<Vec<_>>());
    let titles = StringArray::from(objects.iter().map(|o| o.title.as_str()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(names),
            Arc::new(kinds),
            Arc::new(titles),
            Arc::new(f64_lists(objects.iter().map(|o| o.x_edges.as_slice()))),
            Arc::new(f64_lists(objects.iter().map(|o| o.y_edges.as_slice()))),
            Arc::new(f64_lists(objects.iter().map(|o| o.values.as_slice()))),
            Arc::new(f64_lists(objects.iter().map(|o| o.errors.as_slice()))),
        ],
    )
    .context("building record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating parquet writer")?;
    writer.write(&batch).context("writing parquet batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    let index = batch
        .schema()
        .index_of(name)
        .map_err(|_| anyhow!("Parquet container missing '{name}' column"))?;
    Ok(batch.column(index))
}

fn string_value(col: &ArrayRef, row: usize) -> Result<String> {
    let strings = col
        .as_any()
        .downcast_ref::<StringArray>()
        .context("expected a string column")?;
    Ok(strings.value(row).to_string())
}

fn read_parquet(path: &Path) -> Result<Container> {
    let file = File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut container = Container::new();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let names = column(&batch, "name")?;
        let kinds = column(&batch, "kind")?;
        let titles = column(&batch, "title")?;
        let x_edges = column(&batch, "x_edges")?;
        let y_edges = column(&batch, "y_edges")?;
        let values = column(&batch, "values")?;
        let errors = column(&batch, "errors")?;

        for row in 0..batch.num_rows() {
            let name = string_value(names, row)?;
            let kind_text = string_value(kinds, row)?;
            let kind = ObjectKind::parse(&kind_text)
                .with_context(|| format!("object '{name}': unknown kind '{kind_text}'"))?;
            let object = StoredObject {
                kind,
                title: string_value(titles, row)?,
                x_edges: extract_f64_list(x_edges, row)
                    .with_context(|| format!("object '{name}': failed to read 'x_edges'"))?,
                y_edges: extract_f64_list(y_edges, row)
                    .with_context(|| format!("object '{name}': failed to read 'y_edges'"))?,
                values: extract_f64_list(values, row)
                    .with_context(|| format!("object '{name}': failed to read 'values'"))?,
                errors: extract_f64_list(errors, row)
                    .with_context(|| format!("object '{name}': failed to read 'errors'"))?,
                name,
            };
            debug!("read {} '{}'", object.kind.as_str(), object.name);
            container.insert(object);
        }
    }

    Ok(container)
}

/// Extract a `Vec<f64>` from a List or LargeList column at the given row.
fn extract_f64_list(col: &ArrayRef, row: usize) -> Result<Vec<f64>> {
    if col.is_null(row) {
        bail!("null value in list column");
    }

    let values_array = match col.data_type() {
        DataType::List(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<ListArray>()
                .context("expected ListArray")?;
            list_arr.value(row)
        }
        DataType::LargeList(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<LargeListArray>()
                .context("expected LargeListArray")?;
            list_arr.value(row)
        }
        other => bail!("Expected List or LargeList column, got {other:?}"),
    };

    if let Some(f64_arr) = values_array.as_any().downcast_ref::<Float64Array>() {
        Ok(f64_arr.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    } else if let Some(f32_arr) = values_array.as_any().downcast_ref::<Float32Array>() {
        Ok(f32_arr.iter().map(|v| v.unwrap_or(f32::NAN) as f64).collect())
    } else {
        bail!(
            "List inner type is {:?}, expected Float64 or Float32",
            values_array.data_type()
        )
    }
}
