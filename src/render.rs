use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::{Rgb, RgbImage};
use ndarray::Array2;
use palette::{Hsl, IntoColor, Srgb};

use crate::data::model::GroundTruth;

/// Renders a matrix for visual inspection.
pub trait MatrixPlotter: Send + Sync {
    /// `vmin` / `vmax` clamp the colour scale; `None` uses the data range.
    fn plot(&self, matrix: &GroundTruth, label: &str, vmin: Option<f64>, vmax: Option<f64>)
        -> Result<()>;

    /// Render a curve of values in `[0, 1]`, e.g. top-k accuracy over k.
    /// Defaults to a one-row heatmap.
    fn plot_curve(&self, values: &[f64], label: &str) -> Result<()> {
        let columns = (1..=values.len()).map(|k| k.to_string()).collect();
        let row = Array2::from_shape_vec((1, values.len()), values.to_vec())?;
        let matrix = GroundTruth::new(vec![label.to_string()], columns, row)?;
        self.plot(&matrix, label, Some(0.0), Some(1.0))
    }
}

/// Plotter that draws nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPlotter;

impl MatrixPlotter for NoopPlotter {
    fn plot(&self, matrix: &GroundTruth, label: &str, _: Option<f64>, _: Option<f64>) -> Result<()> {
        log::debug!("plot '{label}' ({:?}) skipped", matrix.shape());
        Ok(())
    }

    fn plot_curve(&self, values: &[f64], label: &str) -> Result<()> {
        log::debug!("curve '{label}' ({} points) skipped", values.len());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Colour scale
// ---------------------------------------------------------------------------

const MISSING: Rgb<u8> = Rgb([128, 128, 128]);
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

/// Bar width and plot height of curve images, in pixels.
const BAR_WIDTH: u32 = 12;
const CURVE_HEIGHT: u32 = 200;

/// Colour of `t` in `[0, 1]`: blue (low energy) through green to red.
pub fn scale_color(t: f64) -> Rgb<u8> {
    let t = t.clamp(0.0, 1.0) as f32;
    let hsl = Hsl::new(240.0 * (1.0 - t), 0.75, 0.55);
    let rgb: Srgb = hsl.into_color();
    Rgb([
        (rgb.red * 255.0) as u8,
        (rgb.green * 255.0) as u8,
        (rgb.blue * 255.0) as u8,
    ])
}

// ---------------------------------------------------------------------------
// HeatmapWriter – one PNG per plot
// ---------------------------------------------------------------------------

/// Writes `<output_dir>/<label>.png`, one square block of pixels per cell.
/// Missing entries are grey.
#[derive(Debug, Clone)]
pub struct HeatmapWriter {
    output_dir: PathBuf,
    max_side: u32,
}

impl HeatmapWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            max_side: 1024,
        }
    }

    /// File a plot with this label is written to.
    pub fn path_for(&self, label: &str) -> PathBuf {
        let stem: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.output_dir.join(format!("{stem}.png"))
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn cell_size(&self, rows: usize, cols: usize) -> u32 {
        let longest = rows.max(cols).max(1) as u32;
        (self.max_side / longest).clamp(1, 16)
    }
}

impl MatrixPlotter for HeatmapWriter {
    fn plot(
        &self,
        matrix: &GroundTruth,
        label: &str,
        vmin: Option<f64>,
        vmax: Option<f64>,
    ) -> Result<()> {
        let (rows, cols) = matrix.shape();
        if rows == 0 || cols == 0 {
            bail!("cannot plot empty matrix '{label}'");
        }

        let finite = matrix.values.iter().copied().filter(|v| v.is_finite());
        let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
        let lo = vmin.unwrap_or(lo);
        let hi = vmax.unwrap_or(hi);
        let span = if hi > lo { hi - lo } else { 1.0 };

        let cell = self.cell_size(rows, cols);
        let mut img = RgbImage::from_pixel(cols as u32 * cell, rows as u32 * cell, MISSING);
        for ((i, j), &v) in matrix.values.indexed_iter() {
            if !v.is_finite() {
                continue;
            }
            let color = scale_color((v - lo) / span);
            for dy in 0..cell {
                for dx in 0..cell {
                    img.put_pixel(j as u32 * cell + dx, i as u32 * cell + dy, color);
                }
            }
        }

        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating {}", self.output_dir.display()))?;
        let path = self.path_for(label);
        img.save(&path)
            .with_context(|| format!("writing heatmap {}", path.display()))?;
        log::info!("heatmap '{label}' written to {}", path.display());
        Ok(())
    }

    /// One bar per value, coloured and sized by the value; `NaN` leaves a gap.
    fn plot_curve(&self, values: &[f64], label: &str) -> Result<()> {
        if values.is_empty() {
            bail!("cannot plot empty curve '{label}'");
        }
        let mut img = RgbImage::from_pixel(values.len() as u32 * BAR_WIDTH, CURVE_HEIGHT, BACKGROUND);
        for (k, &v) in values.iter().enumerate() {
            if !v.is_finite() {
                continue;
            }
            let t = v.clamp(0.0, 1.0);
            let height = (t * CURVE_HEIGHT as f64).round() as u32;
            let color = scale_color(t);
            for y in (CURVE_HEIGHT - height)..CURVE_HEIGHT {
                for dx in 1..BAR_WIDTH - 1 {
                    img.put_pixel(k as u32 * BAR_WIDTH + dx, y, color);
                }
            }
        }

        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating {}", self.output_dir.display()))?;
        let path = self.path_for(label);
        img.save(&path)
            .with_context(|| format!("writing curve {}", path.display()))?;
        log::info!("curve '{label}' written to {}", path.display());
        Ok(())
    }
}
