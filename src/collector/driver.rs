use std::fs::remove_dir_all;
use std::path::Path;

use rand::seq::SliceRandom;

use crate::collector::error::CollectResult;
use crate::collector::sources::SourceSet;
use crate::collector::store::HashStore;
use crate::collector::{
    CategoryCollector, CategoryReport, CategorySpec, CollectionOutcome, CollectorSettings,
    shuffle_rng,
};

/// Removes the scratch tree when dropped, so cleanup happens on every exit
/// path out of the collection loop, including early termination.
struct TempGuard<'a> {
    root: &'a Path,
}

impl Drop for TempGuard<'_> {
    fn drop(&mut self) {
        if !self.root.exists() {
            return;
        }
        match remove_dir_all(self.root) {
            Ok(()) => trace!("Scratch tree {} removed.", self.root.display()),
            Err(e) => warn!("Unable to remove scratch tree {}: {}", self.root.display(), e),
        }
    }
}

/// Top-level loop over all configured categories.
///
/// Categories run in randomized order so reruns do not systematically
/// exhaust the same sources on the same category first. A category that
/// exhausts its retries is reported with its partial count and the loop
/// moves on; only precondition violations stop the run.
pub(crate) struct DatasetDriver<'a> {
    settings: &'a CollectorSettings,
    categories: &'a [CategorySpec],
    sources: &'a mut SourceSet,
    oracle: &'a dyn crate::collector::oracle::Oracle,
    store: &'a mut HashStore,
}

impl<'a> DatasetDriver<'a> {
    pub(crate) fn new(
        settings: &'a CollectorSettings,
        categories: &'a [CategorySpec],
        sources: &'a mut SourceSet,
        oracle: &'a dyn crate::collector::oracle::Oracle,
        store: &'a mut HashStore,
    ) -> Self {
        DatasetDriver {
            settings,
            categories,
            sources,
            oracle,
            store,
        }
    }

    pub(crate) fn run(&mut self) -> CollectResult<Vec<CategoryReport>> {
        let _scratch = TempGuard {
            root: &self.settings.temp_root,
        };

        let mut order: Vec<usize> = (0..self.categories.len()).collect();
        order.shuffle(&mut *shuffle_rng(self.settings.shuffle_seed));

        let mut reports = Vec::with_capacity(self.categories.len());
        for index in order {
            let category = &self.categories[index];
            let result = CategoryCollector::new(
                self.settings,
                &mut *self.sources,
                self.oracle,
                &mut *self.store,
            )
            .collect(category);
            match result {
                Ok(report) => reports.push(report),
                Err(e) if e.is_fatal() => {
                    error!("Halting collection: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("\"{}\" abandoned: {}", category.name, e);
                }
            }
        }

        let met = reports
            .iter()
            .filter(|r| r.outcome == CollectionOutcome::QuotaMet)
            .count();
        info!(
            "Dataset collection finished: {}/{} categories met quota.",
            met,
            self.categories.len()
        );
        Ok(reports)
    }
}
