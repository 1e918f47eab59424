use std::fs::{File, create_dir_all, read_dir, remove_dir_all, remove_file};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};

use crate::collector::error::{CollectError, CollectResult};
use crate::collector::filter::{QualityFilter, is_image_file};
use crate::collector::oracle::{Oracle, matches_category};
use crate::collector::sources::SourceSet;
use crate::collector::store::HashStore;

pub(crate) mod config;
pub(crate) mod dataset;
pub(crate) mod driver;
pub(crate) mod error;
pub(crate) mod filter;
pub(crate) mod oracle;
pub(crate) mod sources;
pub(crate) mod store;

/// Accepted-count interval between progress log lines.
const PROGRESS_INTERVAL: usize = 10;

/// Tunable knobs of a collection run, flattened out of the config so tests
/// can construct them directly.
#[derive(Debug, Clone)]
pub(crate) struct CollectorSettings {
    pub(crate) dataset_root: PathBuf,
    pub(crate) temp_root: PathBuf,
    pub(crate) max_rounds: usize,
    pub(crate) keywords_per_round: usize,
    pub(crate) fetch_cap: usize,
    pub(crate) fetch_concurrency: usize,
    pub(crate) min_dimension: u32,
    pub(crate) filter_batch_size: usize,
    pub(crate) confidence_threshold: f32,
    pub(crate) settle_delay: Duration,
    pub(crate) round_delay: Duration,
    pub(crate) shuffle_seed: Option<u64>,
}

/// A category to collect: directory name, keyword variants, the oracle
/// labels that count as this category, and its target quota.
#[derive(Debug, Clone)]
pub(crate) struct CategorySpec {
    pub(crate) name: String,
    pub(crate) keywords: Vec<String>,
    pub(crate) accepted_labels: Vec<String>,
    pub(crate) quota: usize,
}

/// Stages of one category's collection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundState {
    Idle,
    FetchingRound,
    Filtering,
    Validating,
    Persisting,
    RoundComplete,
    QuotaMet,
    RetriesExhausted,
}

/// How a category's collection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectionOutcome {
    QuotaMet,
    RetriesExhausted,
}

/// Final per-category tally reported by the collector.
#[derive(Debug, Clone)]
pub(crate) struct CategoryReport {
    pub(crate) name: String,
    pub(crate) accepted: usize,
    pub(crate) quota: usize,
    pub(crate) rounds: usize,
    pub(crate) outcome: CollectionOutcome,
}

/// The RNG behind keyword and category shuffles. Seeding it makes retry
/// rounds reproducible; otherwise the thread RNG spreads load differently
/// every run.
pub(crate) fn shuffle_rng(seed: Option<u64>) -> Box<dyn RngCore> {
    match seed {
        Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
        None => Box::new(rand::rng()),
    }
}

/// Per-category orchestrator: drives source rotation, fetch, filter,
/// validation, and persistence against a quota, bounded by the round budget.
pub(crate) struct CategoryCollector<'a> {
    settings: &'a CollectorSettings,
    sources: &'a mut SourceSet,
    oracle: &'a dyn Oracle,
    store: &'a mut HashStore,
    filter: QualityFilter,
    state: RoundState,
}

impl<'a> CategoryCollector<'a> {
    pub(crate) fn new(
        settings: &'a CollectorSettings,
        sources: &'a mut SourceSet,
        oracle: &'a dyn Oracle,
        store: &'a mut HashStore,
    ) -> Self {
        CategoryCollector {
            settings,
            sources,
            oracle,
            store,
            filter: QualityFilter::new(settings.min_dimension),
            state: RoundState::Idle,
        }
    }

    /// Collects images for one category until its quota is met or the round
    /// budget runs out. Transient failures never escape this loop; only
    /// precondition violations (and systemic oracle faults) propagate.
    pub(crate) fn collect(&mut self, category: &CategorySpec) -> CollectResult<CategoryReport> {
        let category_dir = self.settings.dataset_root.join(&category.name);
        create_dir_all(&category_dir)?;

        let existing = count_images(&category_dir);
        info!(
            "Collecting \"{}\" ({}/{} already on disk).",
            category.name, existing, category.quota
        );

        if existing >= category.quota {
            self.transition(RoundState::QuotaMet);
            info!("\"{}\" already meets its quota, skipping.", category.name);
            return Ok(CategoryReport {
                name: category.name.clone(),
                accepted: existing,
                quota: category.quota,
                rounds: 0,
                outcome: CollectionOutcome::QuotaMet,
            });
        }

        let progress = category_progress(&category.name, category.quota, existing);
        let mut keywords = category.keywords.clone();
        let mut rng = shuffle_rng(self.settings.shuffle_seed);
        let mut accepted = existing;
        let mut rounds = 0;

        while accepted < category.quota && rounds < self.settings.max_rounds {
            self.transition(RoundState::FetchingRound);
            clear_scratch(&self.settings.temp_root)?;

            keywords.shuffle(&mut *rng);
            let batch: Vec<String> = keywords
                .iter()
                .take(self.settings.keywords_per_round)
                .cloned()
                .collect();

            let fetched = self.sources.fetch_round(
                &batch,
                self.settings.fetch_cap,
                self.settings.min_dimension,
                &self.settings.temp_root,
                self.settings.fetch_concurrency,
            );
            trace!(
                "Round {}: {} candidates fetched for \"{}\".",
                rounds + 1,
                fetched,
                category.name
            );
            if !self.settings.settle_delay.is_zero() {
                sleep(self.settings.settle_delay);
            }

            accepted = self.process_round(category, &category_dir, accepted, &progress)?;
            rounds += 1;
            self.transition(RoundState::RoundComplete);

            if accepted < category.quota
                && rounds < self.settings.max_rounds
                && !self.settings.round_delay.is_zero()
            {
                sleep(self.settings.round_delay);
            }
        }

        progress.finish_and_clear();
        let outcome = if accepted >= category.quota {
            self.transition(RoundState::QuotaMet);
            CollectionOutcome::QuotaMet
        } else {
            self.transition(RoundState::RetriesExhausted);
            CollectionOutcome::RetriesExhausted
        };
        info!(
            "\"{}\": {}/{} images collected after {} round(s).",
            category.name, accepted, category.quota, rounds
        );

        Ok(CategoryReport {
            name: category.name.clone(),
            accepted,
            quota: category.quota,
            rounds,
            outcome,
        })
    }

    /// Runs filter → validate → persist over everything the fetch stage left
    /// in the scratch tree, returning the updated accepted count.
    fn process_round(
        &mut self,
        category: &CategorySpec,
        category_dir: &Path,
        mut accepted: usize,
        progress: &ProgressBar,
    ) -> CollectResult<usize> {
        for subdir in scratch_subdirs(&self.settings.temp_root) {
            if accepted >= category.quota {
                break;
            }
            let files = candidate_files(&subdir);
            if files.is_empty() {
                continue;
            }

            for chunk in files.chunks(self.settings.filter_batch_size) {
                if accepted >= category.quota {
                    break;
                }

                self.transition(RoundState::Filtering);
                let candidates = self.filter.load_batch(chunk, self.store);
                if candidates.is_empty() {
                    continue;
                }

                self.transition(RoundState::Validating);
                let (images, metas): (Vec<RgbImage>, Vec<_>) = candidates
                    .into_iter()
                    .map(|c| (c.image, (c.hash, c.path)))
                    .unzip();
                let predictions = match self.oracle.predict(&images) {
                    Ok(predictions) => predictions,
                    // Batch failures are assumed systemic to the batch
                    // (bad shape), not image-specific; drop it whole.
                    Err(CollectError::OracleBatch(message)) => {
                        warn!("Discarding batch of {}: {}", images.len(), message);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if predictions.len() != images.len() {
                    warn!(
                        "Discarding batch: {} predictions for {} images.",
                        predictions.len(),
                        images.len()
                    );
                    continue;
                }

                self.transition(RoundState::Persisting);
                for ((image, (hash, path)), image_predictions) in
                    images.iter().zip(metas).zip(predictions)
                {
                    if accepted >= category.quota {
                        break;
                    }
                    if !matches_category(
                        &image_predictions,
                        &category.accepted_labels,
                        self.settings.confidence_threshold,
                    ) {
                        continue;
                    }
                    // Concurrent fetches can surface the same image twice in
                    // one round; the store is authoritative at persist time.
                    if self.store.contains(&hash) {
                        trace!("Late duplicate dropped: {}", path.display());
                        continue;
                    }

                    match persist_image(category_dir, &category.name, accepted, image) {
                        Ok(saved) => {
                            // Count and hash store move together, and only
                            // after the file write succeeded.
                            self.store.insert(hash);
                            accepted += 1;
                            progress.set_position(accepted as u64);
                            trace!("Accepted {}", saved.display());
                            if accepted % PROGRESS_INTERVAL == 0 {
                                info!(
                                    "{}: {}/{} images collected ({:.1}%).",
                                    category.name,
                                    accepted,
                                    category.quota,
                                    accepted as f64 / category.quota as f64 * 100.0
                                );
                            }
                        }
                        Err(e) => warn!("Image not counted: {}", e),
                    }
                }
            }
        }

        Ok(accepted)
    }

    fn transition(&mut self, next: RoundState) {
        if self.state != next {
            trace!("Collector state: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

/// Writes an accepted image into the permanent category directory as a
/// quality-85 JPEG under the next monotonic index. A partial file from a
/// failed encode is removed so reruns do not count it.
fn persist_image(dir: &Path, name: &str, index: usize, image: &RgbImage) -> CollectResult<PathBuf> {
    let path = dir.join(format!("{}_{:04}.jpg", name, index));
    let file = File::create(&path).map_err(|e| CollectError::Persist {
        path: path.clone(),
        message: e.to_string(),
    })?;
    let mut writer = BufWriter::new(file);

    let encoded = JpegEncoder::new_with_quality(&mut writer, 85)
        .encode_image(image)
        .map_err(|e| CollectError::Persist {
            path: path.clone(),
            message: e.to_string(),
        })
        .and_then(|()| {
            writer.flush().map_err(|e| CollectError::Persist {
                path: path.clone(),
                message: e.to_string(),
            })
        });

    if let Err(e) = encoded {
        let _ = remove_file(&path);
        return Err(e);
    }
    Ok(path)
}

/// Number of images already in a category directory. A missing directory is
/// an empty one.
pub(crate) fn count_images(dir: &Path) -> usize {
    match read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file() && is_image_file(&e.path()))
            .count(),
        Err(_) => 0,
    }
}

/// Deterministically resets the scratch tree between rounds.
fn clear_scratch(temp_root: &Path) -> CollectResult<()> {
    if temp_root.exists() {
        remove_dir_all(temp_root)?;
    }
    create_dir_all(temp_root)?;
    Ok(())
}

fn scratch_subdirs(temp_root: &Path) -> Vec<PathBuf> {
    match read_dir(temp_root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn candidate_files(dir: &Path) -> Vec<PathBuf> {
    match read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_image_file(p))
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn category_progress(name: &str, quota: usize, existing: usize) -> ProgressBar {
    const PROGRESS_TEMPLATE: &str = "{prefix:>10} {bar:40} {pos}/{len}";

    let style = ProgressStyle::default_bar()
        .template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    let progress = ProgressBar::new(quota as u64);
    progress.set_style(style);
    progress.set_prefix(name.to_string());
    progress.set_position(existing as u64);
    progress
}
