use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use super::model::LabeledMatrix;

/// Header of the row-label column in written tables.
pub const LABEL_COLUMN: &str = "label";

/// Write a matrix in the layout [`crate::data::loader::load_table`] reads back.
/// `.csv` writes an empty cell for `NaN`; `.parquet` writes a null.
pub fn save_matrix(matrix: &LabeledMatrix<f64>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "csv" => save_csv(matrix, path),
        "parquet" | "pq" => save_parquet(matrix, path),
        other => bail!("Unsupported file extension: .{other}"),
    }
    .with_context(|| format!("saving {}", path.display()))?;

    log::info!(
        "saved {}x{} matrix to {}",
        matrix.rows.len(),
        matrix.columns.len(),
        path.display()
    );
    Ok(())
}

fn save_csv(matrix: &LabeledMatrix<f64>, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).context("creating CSV")?;

    let mut header = Vec::with_capacity(matrix.columns.len() + 1);
    header.push(LABEL_COLUMN);
    header.extend(matrix.columns.iter().map(String::as_str));
    writer.write_record(&header)?;

    for (label, row) in matrix.rows.iter().zip(matrix.values.rows()) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(label.clone());
        record.extend(row.iter().map(|v| {
            if v.is_nan() {
                String::new()
            } else {
                v.to_string()
            }
        }));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn save_parquet(matrix: &LabeledMatrix<f64>, path: &Path) -> Result<()> {
    let mut fields = vec![Field::new(LABEL_COLUMN, DataType::Utf8, false)];
    fields.extend(
        matrix
            .columns
            .iter()
            .map(|c| Field::new(c, DataType::Float64, true)),
    );
    let schema = Arc::new(Schema::new(fields));

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(matrix.columns.len() + 1);
    arrays.push(Arc::new(StringArray::from(
        matrix.rows.iter().map(String::as_str).collect::<Vec<_>>(),
    )));
    for column in matrix.values.columns() {
        let cells: Vec<Option<f64>> = column
            .iter()
            .map(|v| if v.is_nan() { None } else { Some(*v) })
            .collect();
        arrays.push(Arc::new(Float64Array::from(cells)));
    }

    let batch = RecordBatch::try_new(schema.clone(), arrays).context("building record batch")?;

    let file = std::fs::File::create(path).context("creating parquet file")?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}
