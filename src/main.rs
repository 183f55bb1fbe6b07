use std::borrow::Cow;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use prior_select::catalog::{FeatureCatalog, GUEST_PRIORS, HOST_PRIORS};
use prior_select::config::{CatalogSource, Config, DEFAULT_CONFIG_FILE};
use prior_select::data::loader::{load_mask, load_table};
use prior_select::data::model::{EnergyDataset, Orientation};
use prior_select::experiment::{CrossValidationPlan, DriverSettings, ExperimentDriver, Layout};
use prior_select::render::HeatmapWriter;
use prior_select::selection::Direction;
use prior_select::service::kernel::KernelRidge;
use prior_select::service::metrics::RankingMetrics;
use prior_select::service::{Prior, ScoringMethod};

/// Prior selection experiments for host-guest energy regression.
#[derive(Parser, Debug)]
#[command(name = "prior-select", version, about)]
struct Cli {
    /// Configuration file (defaults apply when it does not exist).
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Cross-validate the row family's full prior once.
    CrossValidate {
        /// One row per guest-host pair instead of the wide matrix.
        #[arg(long)]
        skinny: bool,

        /// Hosts as rows (ignored with --skinny).
        #[arg(long)]
        hosts_as_rows: bool,

        /// top_k or top_k_in_top_k.
        #[arg(long)]
        method: Option<ScoringMethod>,

        /// Write the prediction matrix to the output directory.
        #[arg(long)]
        save_predictions: bool,

        /// Write the metrics bundle as JSON to the output directory.
        #[arg(long)]
        write_metrics: bool,

        /// Log this many worst-predicted rows.
        #[arg(long, value_name = "N")]
        inspect: Option<usize>,
    },

    /// Score every feature on its own against the identity baseline.
    Sweep {
        #[arg(long)]
        hosts_as_rows: bool,

        #[arg(long)]
        method: Option<ScoringMethod>,

        /// Report path (default: <output>/sweep_<prior>.tsv).
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Greedy feature selection.
    Select {
        #[arg(long)]
        hosts_as_rows: bool,

        #[arg(short, long)]
        budget: Option<usize>,

        /// forward or backward.
        #[arg(long)]
        direction: Option<Direction>,

        /// Scalar metric to maximise, e.g. top_1_accuracy.
        #[arg(long)]
        metric: Option<String>,

        #[arg(long)]
        method: Option<ScoringMethod>,

        /// Score the candidates of a step in parallel.
        #[arg(long)]
        parallel: bool,

        /// Stop after the first step.
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;

    let dataset = load_dataset(&config)?;
    let service = load_service(&config)?;
    let plotter = HeatmapWriter::new(config.output.directory.join("plots"));
    let driver = ExperimentDriver::new(
        &service,
        &RankingMetrics,
        &plotter,
        DriverSettings::from_config(&config),
    );

    match cli.command {
        Command::CrossValidate {
            skinny,
            hosts_as_rows,
            method,
            save_predictions,
            write_metrics,
            inspect,
        } => {
            let layout = if skinny {
                Layout::Skinny
            } else {
                Layout::Wide(orientation(&config, hosts_as_rows))
            };
            let plan = CrossValidationPlan {
                downsample: config.data.downsample,
                method: method.unwrap_or(config.selection.method),
                save_predictions,
                write_metrics,
                inspect,
                ..CrossValidationPlan::new(layout)
            };
            let outcome = driver.cross_validate(&dataset, &plan)?;
            println!("{}", serde_json::to_string_pretty(&outcome.metrics)?);
        }

        Command::Sweep {
            hosts_as_rows,
            method,
            report,
        } => {
            let orientation = orientation(&config, hosts_as_rows);
            let prior = Prior::for_rows(orientation);
            let catalog = row_catalog(&config, &service, prior)?;
            let features = config
                .sweep
                .features
                .clone()
                .unwrap_or_else(|| catalog.keys().to_vec());
            let report = report.or_else(|| {
                config
                    .output
                    .write_report
                    .then(|| config.output.directory.join(format!("sweep_{prior}.tsv")))
            });

            let outcome = driver.sweep_priors(
                &dataset.oriented(orientation),
                prior,
                &catalog,
                &features,
                method.unwrap_or(config.selection.method),
                report.as_deref(),
            )?;
            for line in &outcome.report_lines {
                println!("{line}");
            }
        }

        Command::Select {
            hosts_as_rows,
            budget,
            direction,
            metric,
            method,
            parallel,
            dry_run,
        } => {
            let selection = &mut config.selection;
            if let Some(budget) = budget {
                selection.budget = budget;
            }
            if let Some(direction) = direction {
                selection.direction = direction;
            }
            if let Some(metric) = metric {
                selection.metric = metric;
            }
            if let Some(method) = method {
                selection.method = method;
            }
            selection.parallel |= parallel;
            selection.dry_run |= dry_run;

            let orientation = orientation(&config, hosts_as_rows);
            let prior = Prior::for_rows(orientation);
            let catalog = row_catalog(&config, &service, prior)?;
            let outcome = driver.greedy_selection(
                &dataset.oriented(orientation),
                &catalog,
                prior,
                &config.selection,
            )?;

            for (step, (key, score)) in outcome
                .selection
                .chosen
                .iter()
                .zip(&outcome.selection.scores)
                .enumerate()
            {
                println!("{}\t{key}\t{score:.4}", step + 1);
            }
            if let Some(metrics) = outcome.final_metrics {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            }
        }
    }

    Ok(())
}

fn orientation(config: &Config, hosts_as_rows: bool) -> Orientation {
    if hosts_as_rows {
        Orientation::HostsAsRows
    } else {
        config.data.orientation
    }
}

/// Ground truth of the configured energy type, with its mask. Stored with
/// guests as rows.
fn load_dataset(config: &Config) -> Result<EnergyDataset> {
    let path = config.data.ground_truth_path()?;
    let ground_truth = load_table(path)?;
    let dataset = match &config.data.mask {
        Some(mask) => EnergyDataset::new(ground_truth, load_mask(mask)?)
            .with_context(|| format!("validity mask {}", mask.display()))?,
        None => EnergyDataset::from_observed(ground_truth),
    };
    log::info!(
        "{} energies: {:?} matrix, {} observations",
        config.data.energy,
        dataset.shape(),
        dataset.observation_count()
    );
    Ok(dataset)
}

fn load_service(config: &Config) -> Result<KernelRidge> {
    let mut service = KernelRidge::new(config.model.kernel());
    if let Some(path) = &config.data.guest_priors {
        service = service.with_guest_priors(load_prior(path)?);
    }
    if let Some(path) = &config.data.host_priors {
        service = service.with_host_priors(load_prior(path)?);
    }
    Ok(service)
}

fn load_prior(path: &Path) -> Result<prior_select::data::model::PriorTable> {
    load_table(path).with_context(|| format!("prior table {}", path.display()))
}

/// Candidate features of the row family. Built-in catalogs are borrowed.
fn row_catalog(
    config: &Config,
    service: &KernelRidge,
    prior: Prior,
) -> Result<Cow<'static, FeatureCatalog>> {
    let catalog = match (config.selection.catalog, prior) {
        (CatalogSource::Builtin, Prior::Host) => Cow::Borrowed(&*HOST_PRIORS),
        (CatalogSource::Builtin, _) => Cow::Borrowed(&*GUEST_PRIORS),
        (CatalogSource::Table, Prior::Host) => Cow::Owned(FeatureCatalog::from_prior_table(
            service.host_priors().context("no [data] host-priors table configured")?,
        )?),
        (CatalogSource::Table, _) => Cow::Owned(FeatureCatalog::from_prior_table(
            service.guest_priors().context("no [data] guest-priors table configured")?,
        )?),
    };
    Ok(catalog)
}
