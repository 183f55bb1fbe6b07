use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{
    Array, AsArray, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array,
    StringArray,
};
use arrow::datatypes::DataType;
use ndarray::Array2;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::{LabeledMatrix, ValidityMask};

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load a labelled numeric table (energy matrix or prior table). Dispatch by
/// extension.
///
/// Supported formats:
/// * `.parquet` – first column holds row labels (string), every other column
///   is numeric; nulls become `NaN`
/// * `.json`    – index-oriented object `{ "row": { "column": value } }`, the
///   layout of `df.to_json(orient='index')`
/// * `.csv`     – header row of column labels (first cell names the row-label
///   column), one labelled row per line; empty cells and `nan` become `NaN`
pub fn load_table(path: &Path) -> Result<LabeledMatrix<f64>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let table = match ext.as_str() {
        "parquet" | "pq" => load_parquet(path),
        "json" => load_json(path),
        "csv" => load_csv(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
    .with_context(|| format!("loading {}", path.display()))?;

    log::debug!(
        "loaded {} ({} rows x {} columns)",
        path.display(),
        table.rows.len(),
        table.columns.len()
    );
    Ok(table)
}

/// Load an explicit validity mask: any finite non-zero entry is an observation.
pub fn load_mask(path: &Path) -> Result<ValidityMask> {
    let table = load_table(path)?;
    Ok(table.map(|v| v.is_finite() && *v != 0.0))
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

fn load_csv(path: &Path) -> Result<LabeledMatrix<f64>> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers = reader.headers().context("reading CSV headers")?.clone();

    if headers.len() < 2 {
        bail!("CSV needs a row-label column and at least one value column");
    }
    let columns: Vec<String> = headers.iter().skip(1).map(|h| h.to_string()).collect();

    let mut rows = Vec::new();
    let mut buffer = Vec::new();

    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        if record.len() != headers.len() {
            bail!(
                "CSV row {row_no}: expected {} fields, found {}",
                headers.len(),
                record.len()
            );
        }

        rows.push(record.get(0).unwrap_or("").to_string());
        for (j, cell) in record.iter().skip(1).enumerate() {
            buffer.push(parse_cell(cell).with_context(|| {
                format!("Row {row_no}, column '{}': '{cell}' is not a number", columns[j])
            })?);
        }
    }

    assemble(rows, columns, buffer)
}

fn parse_cell(cell: &str) -> Result<f64> {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
        return Ok(f64::NAN);
    }
    Ok(cell.parse::<f64>()?)
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON schema (index-oriented):
///
/// ```json
/// {
///   "C[N+](C)(C)C": { "CHA": -12.4, "AEI": null },
///   "CC[N+](CC)(CC)CC": { "CHA": -9.1, "AEI": -11.0 }
/// }
/// ```
fn load_json(path: &Path) -> Result<LabeledMatrix<f64>> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    let records = root
        .as_object()
        .context("Expected top-level JSON object keyed by row label")?;

    let mut columns: Vec<String> = Vec::new();
    for rec in records.values() {
        let obj = rec.as_object().context("Row value is not a JSON object")?;
        for key in obj.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }

    let mut rows = Vec::with_capacity(records.len());
    let mut buffer = Vec::with_capacity(records.len() * columns.len());

    for (label, rec) in records {
        let obj = rec
            .as_object()
            .with_context(|| format!("Row '{label}' is not a JSON object"))?;
        rows.push(label.clone());
        for col in &columns {
            let value = match obj.get(col) {
                None | Some(JsonValue::Null) => f64::NAN,
                Some(v) => v
                    .as_f64()
                    .with_context(|| format!("Row '{label}', column '{col}': not a number"))?,
            };
            buffer.push(value);
        }
    }

    assemble(rows, columns, buffer)
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a wide Parquet table.
///
/// Expected schema:
/// - column 0: Utf8 or LargeUtf8 – row labels
/// - every other column: Float64, Float32, Int64, Int32 or Boolean
///
/// Works with files written by **Pandas** (`df.reset_index().to_parquet()`),
/// **Polars** and by [`crate::data::persist::save_matrix`].
fn load_parquet(path: &Path) -> Result<LabeledMatrix<f64>> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;

    let columns: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .skip(1)
        .map(|f| f.name().clone())
        .collect();
    if columns.is_empty() {
        bail!("Parquet file needs a row-label column and at least one value column");
    }

    let reader = builder.build().context("building parquet reader")?;

    let mut rows = Vec::new();
    let mut buffer = Vec::new();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let labels = batch.column(0);

        for row in 0..batch.num_rows() {
            rows.push(extract_label(labels, row).with_context(|| format!("Row {row}: label"))?);
            for (j, col_name) in columns.iter().enumerate() {
                let value = extract_f64(batch.column(j + 1), row)
                    .with_context(|| format!("Row {row}: failed to read '{col_name}'"))?;
                buffer.push(value);
            }
        }
    }

    assemble(rows, columns, buffer)
}

// -- Parquet / Arrow helpers --

fn extract_label(col: &Arc<dyn Array>, row: usize) -> Result<String> {
    if col.is_null(row) {
        bail!("null row label");
    }
    match col.data_type() {
        DataType::Utf8 => {
            let arr = col
                .as_any()
                .downcast_ref::<StringArray>()
                .context("expected StringArray")?;
            Ok(arr.value(row).to_string())
        }
        DataType::LargeUtf8 => Ok(col.as_string::<i64>().value(row).to_string()),
        other => bail!("Row labels must be strings, got {other:?}"),
    }
}

/// Extract one cell of a numeric Arrow column as `f64`.
fn extract_f64(col: &Arc<dyn Array>, row: usize) -> Result<f64> {
    if col.is_null(row) {
        return Ok(f64::NAN);
    }
    let value = match col.data_type() {
        DataType::Float64 => downcast::<Float64Array>(col)?.value(row),
        DataType::Float32 => downcast::<Float32Array>(col)?.value(row) as f64,
        DataType::Int64 => downcast::<Int64Array>(col)?.value(row) as f64,
        DataType::Int32 => downcast::<Int32Array>(col)?.value(row) as f64,
        DataType::Boolean => {
            if downcast::<BooleanArray>(col)?.value(row) {
                1.0
            } else {
                0.0
            }
        }
        other => bail!("Expected a numeric column, got {other:?}"),
    };
    Ok(value)
}

fn downcast<A: Array + 'static>(col: &Arc<dyn Array>) -> Result<&A> {
    col.as_any()
        .downcast_ref::<A>()
        .with_context(|| format!("column is not a {}", std::any::type_name::<A>()))
}

fn assemble(rows: Vec<String>, columns: Vec<String>, buffer: Vec<f64>) -> Result<LabeledMatrix<f64>> {
    let values = Array2::from_shape_vec((rows.len(), columns.len()), buffer)
        .context("table cells do not form a rectangle")?;
    Ok(LabeledMatrix::new(rows, columns, values)?)
}
