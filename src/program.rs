use std::env::current_dir;

use anyhow::Error;
use console::Term;

use crate::collector::config::Config;
use crate::collector::dataset;
use crate::collector::driver::DatasetDriver;
use crate::collector::oracle::RemoteOracle;
use crate::collector::sources::SourceSet;
use crate::collector::store::{HashStore, perceptual_hasher};
use crate::collector::{CategoryReport, CollectionOutcome};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A program class that handles the flow of a dataset collection run.
pub(crate) struct Program;

impl Program {
    /// Creates a new instance of the program.
    pub(crate) fn new() -> Self {
        Self
    }

    /// Runs the collector program.
    pub(crate) fn run(&self) -> Result<(), Error> {
        Term::stdout().set_title("dataset collector");
        trace!("Starting dataset collector...");
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        if let Ok(dir) = current_dir() {
            trace!("Program Working Directory: {}", dir.display());
        }

        // Check the config file and ensure that it is created.
        trace!("Checking if config file exists...");
        if !Config::config_exists() {
            info!("Creating config file with the default category tables...");
            Config::create_config()?;
            info!("Edit it to adjust quotas or categories; continuing with the defaults.");
        }

        let config = Config::get()?;
        let settings = config.settings();
        let categories = config.category_specs();
        info!(
            "{} categories configured, dataset root \"{}\".",
            categories.len(),
            config.dataset_root()
        );

        let mut sources = SourceSet::with_default_backends()?;
        trace!("{} search backends in rotation.", sources.backend_count());

        let oracle = RemoteOracle::new(
            config.oracle_endpoint(),
            config.oracle_input_size(),
            config.top_k(),
        )?;

        // Hashes of everything already on disk, so reruns are incremental.
        let hasher = perceptual_hasher();
        let mut store = HashStore::new();
        store.seed_from_dataset(&settings.dataset_root, &hasher);

        let reports =
            DatasetDriver::new(&settings, &categories, &mut sources, &oracle, &mut store).run()?;
        self.print_summary(&reports);

        // Consumption-phase precondition: the tree must exist for training.
        let summary = dataset::summarize(&settings.dataset_root)?;
        info!(
            "Dataset ready: {} images across {} categories.",
            summary.total,
            summary.categories.len()
        );

        Ok(())
    }

    fn print_summary(&self, reports: &[CategoryReport]) {
        let term = Term::stdout();
        let _ = term.write_line("");
        for report in reports {
            let status = match report.outcome {
                CollectionOutcome::QuotaMet => "quota met",
                CollectionOutcome::RetriesExhausted => "retries exhausted",
            };
            let _ = term.write_line(&format!(
                "{:>12}  {}/{}  ({})",
                report.name, report.accepted, report.quota, status
            ));
        }
    }
}
