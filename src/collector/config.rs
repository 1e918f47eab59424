use std::fs::{read_to_string, write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{from_str, to_string_pretty};

use crate::collector::error::{CollectError, CollectResult};
use crate::collector::{CategorySpec, CollectorSettings};

/// Name of the configuration file.
pub(crate) const CONFIG_NAME: &str = "collector.json";

static CONFIG: OnceCell<Config> = OnceCell::new();

/// Config that is used to do general setup of the collection run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct Config {
    /// Root directory of the permanent dataset tree.
    #[serde(rename = "datasetRoot", default = "default_dataset_root")]
    dataset_root: String,
    /// Root directory of the round-scoped temp scratch tree.
    #[serde(rename = "tempRoot", default = "default_temp_root")]
    temp_root: String,
    /// Target number of accepted images per category.
    #[serde(rename = "quota", default = "default_quota")]
    quota: usize,
    /// Maximum fetch-filter-validate rounds per category.
    #[serde(rename = "maxRounds", default = "default_max_rounds")]
    max_rounds: usize,
    /// Keywords submitted per round.
    #[serde(rename = "keywordsPerRound", default = "default_keywords_per_round")]
    keywords_per_round: usize,
    /// Result cap passed to each backend per keyword.
    #[serde(rename = "fetchCap", default = "default_fetch_cap")]
    fetch_cap: usize,
    /// Concurrent keyword fetches per round.
    #[serde(rename = "fetchConcurrency", default = "default_fetch_concurrency")]
    fetch_concurrency: usize,
    /// Minimum acceptable width and height in pixels.
    #[serde(rename = "minDimension", default = "default_min_dimension")]
    min_dimension: u32,
    /// Images loaded per filter/validate batch.
    #[serde(rename = "filterBatchSize", default = "default_filter_batch_size")]
    filter_batch_size: usize,
    /// Number of top predictions decoded per image.
    #[serde(rename = "topK", default = "default_top_k")]
    top_k: usize,
    /// Confidence floor for label acceptance (strictly greater-than).
    #[serde(rename = "confidenceThreshold", default = "default_confidence_threshold")]
    confidence_threshold: f32,
    /// Seconds to let in-flight downloads settle after a fetch round.
    #[serde(rename = "settleSecs", default = "default_settle_secs")]
    settle_secs: u64,
    /// Seconds between rounds, so remote sources are not hammered.
    #[serde(rename = "roundDelaySecs", default = "default_round_delay_secs")]
    round_delay_secs: u64,
    /// Optional seed for keyword/category shuffles (reproducible runs).
    #[serde(rename = "shuffleSeed", default)]
    shuffle_seed: Option<u64>,
    /// Predict endpoint of the frozen validation model.
    #[serde(rename = "oracleEndpoint", default = "default_oracle_endpoint")]
    oracle_endpoint: String,
    /// Input edge size expected by the validation model.
    #[serde(rename = "oracleInputSize", default = "default_oracle_input_size")]
    oracle_input_size: u32,
    /// The categories to collect, with keyword variants and accepted labels.
    #[serde(rename = "categories", default = "default_categories")]
    categories: Vec<CategoryConfig>,
}

/// A single category entry: its directory name, the keyword variants used to
/// query the search backends, and the oracle labels that count as a match.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct CategoryConfig {
    #[serde(rename = "name")]
    name: String,
    #[serde(rename = "keywords")]
    keywords: Vec<String>,
    #[serde(rename = "acceptedLabels")]
    accepted_labels: Vec<String>,
    /// Per-category quota override.
    #[serde(rename = "quota", default)]
    quota: Option<usize>,
}

fn default_dataset_root() -> String {
    String::from("dataset")
}
fn default_temp_root() -> String {
    String::from("temp_images")
}
fn default_quota() -> usize {
    500
}
fn default_max_rounds() -> usize {
    20
}
fn default_keywords_per_round() -> usize {
    5
}
fn default_fetch_cap() -> usize {
    200
}
fn default_fetch_concurrency() -> usize {
    num_cpus::get().clamp(2, 8)
}
fn default_min_dimension() -> u32 {
    150
}
fn default_filter_batch_size() -> usize {
    50
}
fn default_top_k() -> usize {
    5
}
fn default_confidence_threshold() -> f32 {
    0.2
}
fn default_settle_secs() -> u64 {
    5
}
fn default_round_delay_secs() -> u64 {
    2
}
fn default_oracle_endpoint() -> String {
    String::from("http://127.0.0.1:8500/v1/predict")
}
fn default_oracle_input_size() -> u32 {
    224
}

impl Config {
    /// Checks config and ensures it isn't missing.
    pub(crate) fn config_exists() -> bool {
        if !Path::new(CONFIG_NAME).exists() {
            trace!("{}: does not exist!", CONFIG_NAME);
            return false;
        }

        true
    }

    /// Creates a config file populated with the default category tables.
    pub(crate) fn create_config() -> CollectResult<()> {
        let config = Config::default_config();
        let json = to_string_pretty(&config)
            .map_err(|e| CollectError::Config(format!("unable to serialize config: {e}")))?;
        write(CONFIG_NAME, json)?;
        info!("{} created with the default category tables.", CONFIG_NAME);
        Ok(())
    }

    /// Loads and caches the config, creating the default file first if needed.
    pub(crate) fn get() -> CollectResult<&'static Self> {
        CONFIG.get_or_try_init(|| {
            let contents = read_to_string(CONFIG_NAME)
                .map_err(|e| CollectError::Config(format!("unable to read {CONFIG_NAME}: {e}")))?;
            let config: Config = from_str(&contents)
                .map_err(|e| CollectError::Config(format!("unable to parse {CONFIG_NAME}: {e}")))?;
            config.validate()?;
            Ok(config)
        })
    }

    fn validate(&self) -> CollectResult<()> {
        if self.categories.is_empty() {
            return Err(CollectError::Config(String::from(
                "at least one category must be configured",
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(CollectError::Config(format!(
                "confidenceThreshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.max_rounds == 0 || self.keywords_per_round == 0 {
            return Err(CollectError::Config(String::from(
                "maxRounds and keywordsPerRound must be nonzero",
            )));
        }
        for category in &self.categories {
            if category.keywords.is_empty() || category.accepted_labels.is_empty() {
                return Err(CollectError::Config(format!(
                    "category \"{}\" needs keywords and accepted labels",
                    category.name
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn dataset_root(&self) -> &str {
        &self.dataset_root
    }

    pub(crate) fn oracle_endpoint(&self) -> &str {
        &self.oracle_endpoint
    }

    pub(crate) fn oracle_input_size(&self) -> u32 {
        self.oracle_input_size
    }

    pub(crate) fn top_k(&self) -> usize {
        self.top_k
    }

    /// Flattens the tunable knobs into the settings struct the collector
    /// takes by value, so tests can build one without a config file.
    pub(crate) fn settings(&self) -> CollectorSettings {
        CollectorSettings {
            dataset_root: PathBuf::from(&self.dataset_root),
            temp_root: PathBuf::from(&self.temp_root),
            max_rounds: self.max_rounds,
            keywords_per_round: self.keywords_per_round,
            fetch_cap: self.fetch_cap,
            fetch_concurrency: self.fetch_concurrency,
            min_dimension: self.min_dimension,
            filter_batch_size: self.filter_batch_size,
            confidence_threshold: self.confidence_threshold,
            settle_delay: Duration::from_secs(self.settle_secs),
            round_delay: Duration::from_secs(self.round_delay_secs),
            shuffle_seed: self.shuffle_seed,
        }
    }

    /// Resolves every category entry against the global quota.
    pub(crate) fn category_specs(&self) -> Vec<CategorySpec> {
        self.categories
            .iter()
            .map(|c| CategorySpec {
                name: c.name.clone(),
                keywords: c.keywords.clone(),
                accepted_labels: c.accepted_labels.clone(),
                quota: c.quota.unwrap_or(self.quota),
            })
            .collect()
    }

    fn default_config() -> Self {
        Config {
            dataset_root: default_dataset_root(),
            temp_root: default_temp_root(),
            quota: default_quota(),
            max_rounds: default_max_rounds(),
            keywords_per_round: default_keywords_per_round(),
            fetch_cap: default_fetch_cap(),
            fetch_concurrency: default_fetch_concurrency(),
            min_dimension: default_min_dimension(),
            filter_batch_size: default_filter_batch_size(),
            top_k: default_top_k(),
            confidence_threshold: default_confidence_threshold(),
            settle_secs: default_settle_secs(),
            round_delay_secs: default_round_delay_secs(),
            shuffle_seed: None,
            oracle_endpoint: default_oracle_endpoint(),
            oracle_input_size: default_oracle_input_size(),
            categories: default_categories(),
        }
    }
}

fn category(name: &str, keywords: &[&str], accepted_labels: &[&str]) -> CategoryConfig {
    CategoryConfig {
        name: name.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        accepted_labels: accepted_labels.iter().map(|l| l.to_string()).collect(),
        quota: None,
    }
}

/// The reference category tables: keyword variants span several languages so
/// successive rounds hit different slices of each backend's index, and the
/// accepted-label sets map the oracle's fine-grained vocabulary (breeds,
/// models, species) down onto each category.
fn default_categories() -> Vec<CategoryConfig> {
    vec![
        category(
            "cat",
            &[
                "kedi", "kediler", "ev kedisi", "cat", "cats", "kitten", "cute cat",
                "domestic cat", "katze", "hauskatze", "chat", "chat mignon", "gato",
                "gatito", "neko",
            ],
            &["cat", "tabby", "persian_cat", "siamese_cat", "egyptian_cat", "tiger_cat"],
        ),
        category(
            "dog",
            &[
                "köpek", "köpekler", "sevimli köpek", "dog", "dogs", "puppy", "puppies",
                "cute dog", "hund", "welpe", "chien", "chiot", "perro", "perros", "inu",
            ],
            &[
                "dog", "golden_retriever", "labrador", "german_shepherd", "beagle",
                "husky", "collie", "poodle", "terrier", "spaniel", "bulldog", "hound",
            ],
        ),
        category(
            "car",
            &[
                "araba", "otomobil", "spor araba", "car", "cars", "automobile",
                "sports car", "luxury car", "auto", "kraftfahrzeug", "voiture", "coche",
                "coches", "kuruma",
            ],
            &[
                "car", "sports_car", "passenger_car", "automobile", "cab", "jeep",
                "limousine", "convertible", "minivan", "race_car", "pickup",
            ],
        ),
        category(
            "house",
            &[
                "ev", "konut", "villa", "apartman", "house", "home", "building",
                "residence", "mansion", "haus", "wohnung", "maison", "casa", "ie",
            ],
            &["house", "home", "building", "residence", "mansion", "dwelling", "palace", "cottage"],
        ),
        category(
            "tree",
            &[
                "ağaç", "ağaçlar", "orman", "çam ağacı", "tree", "trees", "forest",
                "pine tree", "oak tree", "baum", "wald", "arbre", "forêt", "árbol", "ki",
            ],
            &["tree", "forest", "pine_tree", "oak", "maple", "birch", "palm", "juniper", "cypress"],
        ),
        category(
            "person",
            &[
                "insan", "insanlar", "portre", "kişi", "person", "people", "human",
                "human face", "portrait", "menschen", "gesicht", "personne", "visage",
                "personas", "hito",
            ],
            &[
                "person", "people", "human", "face", "man", "woman", "child", "boy",
                "girl", "portrait",
            ],
        ),
        category(
            "bird",
            &[
                "kuş", "kuşlar", "yabani kuş", "papağan", "bird", "birds", "sparrow",
                "parrot", "eagle", "vogel", "oiseau", "oiseaux", "pájaro", "tori",
            ],
            &[
                "bird", "parrot", "eagle", "sparrow", "hawk", "robin", "cardinal",
                "peacock", "owl", "finch", "canary", "chicken", "pigeon", "flamingo",
                "jay", "hummingbird",
            ],
        ),
        category(
            "flower",
            &[
                "çiçek", "çiçekler", "gül", "lale", "ayçiçeği", "flower", "flowers",
                "rose", "tulip", "sunflower", "blume", "blumen", "fleur", "flor", "hana",
            ],
            &[
                "flower", "rose", "tulip", "sunflower", "daisy", "lily", "orchid",
                "iris", "carnation", "poppy", "daffodil", "blossom", "petal",
            ],
        ),
        category(
            "phone",
            &[
                "telefon", "cep telefonu", "akıllı telefon", "phone", "mobile phone",
                "smartphone", "cellphone", "iphone", "handy", "téléphone", "teléfono",
                "móvil", "keitai",
            ],
            &["phone", "mobile_phone", "smartphone", "cellphone", "iphone", "telephone"],
        ),
        category(
            "computer",
            &[
                "bilgisayar", "dizüstü", "laptop", "notebook", "computer",
                "desktop computer", "pc", "ordinateur", "rechner", "computadora",
                "ordenador", "pasokon",
            ],
            &[
                "computer", "laptop", "desktop_computer", "pc", "monitor", "keyboard",
                "notebook", "screen", "workstation", "macbook", "chromebook",
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let config = Config::default_config();
        let json = to_string_pretty(&config).unwrap();
        let parsed: Config = from_str(&json).unwrap();
        assert_eq!(parsed.categories.len(), 10);
        assert_eq!(parsed.quota, 500);
        assert_eq!(parsed.confidence_threshold, 0.2);
        parsed.validate().unwrap();
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let parsed: Config = from_str(r#"{ "quota": 25 }"#).unwrap();
        assert_eq!(parsed.quota, 25);
        assert_eq!(parsed.max_rounds, 20);
        assert_eq!(parsed.min_dimension, 150);
        assert_eq!(parsed.categories.len(), 10);
    }

    #[test]
    fn category_specs_resolve_quota_overrides() {
        let mut config = Config::default_config();
        config.categories[0].quota = Some(50);
        let specs = config.category_specs();
        assert_eq!(specs[0].quota, 50);
        assert_eq!(specs[1].quota, 500);
    }

    #[test]
    fn empty_category_table_is_rejected() {
        let config: Config = from_str(r#"{ "categories": [] }"#).unwrap();
        assert!(config.validate().is_err());
    }
}
