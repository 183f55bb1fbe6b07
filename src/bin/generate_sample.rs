//! Writes a synthetic guest x host energy dataset plus matching prior tables.
//!
//! Usage: `generate_sample [output_dir]` (default `sample_data`).

use std::path::PathBuf;

use anyhow::Result;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use prior_select::catalog::{FeatureCatalog, GUEST_PRIORS, HOST_PRIORS};
use prior_select::data::model::LabeledMatrix;
use prior_select::data::persist::save_matrix;

const GUESTS: usize = 40;
const HOSTS: usize = 25;
const MISSING_FRACTION: f64 = 0.3;

/// Box-Muller transform for normal distribution
fn gauss(rng: &mut StdRng, mean: f64, std_dev: f64) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(1e-15);
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + std_dev * z
}

fn prior_table(
    rng: &mut StdRng,
    prefix: &str,
    n: usize,
    catalog: &FeatureCatalog,
) -> Result<LabeledMatrix<f64>> {
    let rows: Vec<String> = (0..n).map(|i| format!("{prefix}_{i:03}")).collect();
    let values = Array2::from_shape_simple_fn((n, catalog.len()), || gauss(rng, 0.0, 1.0));
    Ok(LabeledMatrix::new(rows, catalog.keys().to_vec(), values)?)
}

/// Energies driven by the first two descriptors of each family, plus noise.
/// Unobserved pairs are `NaN`.
fn energies(
    rng: &mut StdRng,
    guests: &LabeledMatrix<f64>,
    hosts: &LabeledMatrix<f64>,
    offset: f64,
) -> Result<LabeledMatrix<f64>> {
    let mut values = Array2::from_elem((guests.rows.len(), hosts.rows.len()), f64::NAN);
    for ((i, j), v) in values.indexed_iter_mut() {
        if rng.gen::<f64>() < MISSING_FRACTION {
            continue;
        }
        let g = &guests.values;
        let h = &hosts.values;
        let fit = 2.5 * g[[i, 0]] - 1.5 * g[[i, 1]] + 2.0 * h[[j, 0]] + g[[i, 1]] * h[[j, 1]];
        *v = (offset - fit + gauss(rng, 0.0, 0.5)).clamp(-30.0, 5.0);
    }
    Ok(LabeledMatrix::new(
        guests.rows.clone(),
        hosts.rows.clone(),
        values,
    )?)
}

fn main() -> Result<()> {
    env_logger::init();
    let out: PathBuf = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "sample_data".to_string())
        .into();
    let mut rng = StdRng::seed_from_u64(42);

    let guests = prior_table(&mut rng, "osda", GUESTS, &GUEST_PRIORS)?;
    let hosts = prior_table(&mut rng, "zeo", HOSTS, &HOST_PRIORS)?;
    let binding = energies(&mut rng, &guests, &hosts, -12.0)?;
    let templating = energies(&mut rng, &guests, &hosts, -4.0)?;

    save_matrix(&guests, &out.join("guest_priors.csv"))?;
    save_matrix(&hosts, &out.join("host_priors.csv"))?;
    save_matrix(&binding, &out.join("binding.parquet"))?;
    save_matrix(&templating, &out.join("templating.parquet"))?;

    println!(
        "Wrote {GUESTS} guests x {HOSTS} hosts ({} binding observations) to {}",
        binding.observed().count(),
        out.display()
    );
    Ok(())
}
