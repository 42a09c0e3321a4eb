use std::convert::TryInto;
use std::ffi::OsStr;
use std::fs::File;

use justconfig::item::ValueExtractor;
use justconfig::processors::Trim;
use justconfig::sources::env::Env;
use justconfig::sources::text::ConfigText;
use justconfig::ConfPath;
use justconfig::Config;

use crate::config_processors::Unquote;
use crate::error::{EngineError, Result};
use crate::rules::RatingPolicy;

// Set some default values
const DEFAULT_MAX_NEIGHBORS: usize = 20;
const DEFAULT_WINDOW_SIZE: usize = 20;
const DEFAULT_WINDOW_STEP: usize = 10;
const DEFAULT_REFINE_DEPTH: usize = 2;
const DEFAULT_BAND_SIGMAS: f64 = 1.0;
const DEFAULT_INSERT_SAMPLE_SIZE: usize = 64;
const DEFAULT_REBUILD_BATCH_SIZE: usize = 256;
const DEFAULT_DRIFT_REBUILD_THRESHOLD: usize = 1000;

const DEFAULT_MAX_PACKAGES: usize = 1000;
const DEFAULT_PACKAGE_SIZE: usize = 10;
const DEFAULT_PACKAGE_TIMEOUT_SECS: i64 = 3600;

const DEFAULT_MIN_SUPPORT: u32 = 2;
const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;
const DEFAULT_MAX_ITEMSET_SIZE: usize = 3;
const DEFAULT_MIN_PACKAGE_SIZE: usize = 2;
const DEFAULT_BIDIRECTIONAL_MAX_IMBALANCE: f64 = 0.35;
const DEFAULT_MAX_RULES: usize = 10_000;

// Every transaction is expanded into all its subsets up to this size.
const MAX_ITEMSET_SIZE: usize = 8;

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub graph: GraphConfig,
    pub history: HistoryConfig,
    pub rules: RuleConfig,
    pub workers: WorkerConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GraphConfig {
    /// Upper bound on the neighbor list of every item.
    pub max_neighbors: usize,
    pub window_size: usize,
    pub window_step: usize,
    pub refine_depth: usize,
    /// Half width of the refinement band in standard deviations.
    pub band_sigmas: f64,
    pub insert_sample_size: usize,
    /// Batches at least this large trigger a full rebuild on commit.
    pub rebuild_batch_size: usize,
    pub drift_rebuild_threshold: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistoryConfig {
    pub max_packages: usize,
    pub package_size: usize,
    pub package_timeout_secs: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RuleConfig {
    pub min_support: u32,
    pub min_confidence: f64,
    pub max_itemset_size: usize,
    pub min_package_size: usize,
    pub bidirectional_max_imbalance: f64,
    pub rating_policy: RatingPolicy,
    pub max_rules: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerConfig {
    pub num_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let conf = Config::default();
        EngineConfig {
            graph: GraphConfig::parse(&conf, ConfPath::from(&["graph"])),
            history: HistoryConfig::parse(&conf, ConfPath::from(&["history"])),
            rules: RuleConfig::default(),
            workers: WorkerConfig::parse(&conf, ConfPath::from(&["workers"])),
        }
    }
}

impl EngineConfig {
    pub fn new(config_path: &str) -> Result<EngineConfig> {
        // Initialize config object
        let mut conf = Config::default();

        // Check if there is a config file
        if let Ok(config_file) = File::open(config_path) {
            let config_text = ConfigText::new(config_file, config_path).map_err(|e| {
                EngineError::Configuration(format!("loading {} failed: {}", config_path, e))
            })?;
            conf.add_source(config_text);
        }

        // Define config params from environment variables
        let config_env = Env::new(&[
            (
                ConfPath::from(&["workers", "num_workers"]),
                OsStr::new("MUNIN_NUM_WORKERS"),
            ),
            (
                ConfPath::from(&["graph", "max_neighbors"]),
                OsStr::new("MUNIN_MAX_NEIGHBORS"),
            ),
        ]);
        conf.add_source(config_env);

        let config = EngineConfig::parse(&conf)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(conf: &Config) -> Result<EngineConfig> {
        Ok(EngineConfig {
            graph: GraphConfig::parse(conf, ConfPath::from(&["graph"])),
            history: HistoryConfig::parse(conf, ConfPath::from(&["history"])),
            rules: RuleConfig::parse(conf, ConfPath::from(&["rules"]))?,
            workers: WorkerConfig::parse(conf, ConfPath::from(&["workers"])),
        })
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(EngineError::Configuration(reason.to_string()));

        if self.graph.max_neighbors == 0 {
            return invalid("graph.max_neighbors must be at least 1");
        }
        if self.graph.window_size < 2 {
            return invalid("graph.window_size must be at least 2");
        }
        if self.graph.window_step == 0 || self.graph.window_step > self.graph.window_size {
            return invalid("graph.window_step must be in 1..=graph.window_size");
        }
        if !self.graph.band_sigmas.is_finite() || self.graph.band_sigmas < 0.0 {
            return invalid("graph.band_sigmas must be a non negative number");
        }
        if self.history.max_packages == 0 || self.history.package_size == 0 {
            return invalid("history.max_packages and history.package_size must be at least 1");
        }
        if self.history.package_timeout_secs <= 0 {
            return invalid("history.package_timeout_secs must be positive");
        }
        if self.rules.min_support == 0 {
            return invalid("rules.min_support must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.rules.min_confidence) {
            return invalid("rules.min_confidence must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.rules.bidirectional_max_imbalance) {
            return invalid("rules.bidirectional_max_imbalance must be in [0, 1]");
        }
        if !(2..=MAX_ITEMSET_SIZE).contains(&self.rules.max_itemset_size) {
            return invalid("rules.max_itemset_size must be in 2..=8");
        }
        if self.workers.num_workers == 0 {
            return invalid("workers.num_workers must be at least 1");
        }
        Ok(())
    }
}

impl GraphConfig {
    fn parse(conf: &Config, path: ConfPath) -> GraphConfig {
        GraphConfig {
            max_neighbors: conf
                .get(path.push("max_neighbors"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_MAX_NEIGHBORS),
            window_size: conf
                .get(path.push("window_size"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_WINDOW_SIZE),
            window_step: conf
                .get(path.push("window_step"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_WINDOW_STEP),
            refine_depth: conf
                .get(path.push("refine_depth"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_REFINE_DEPTH),
            band_sigmas: conf
                .get(path.push("band_sigmas"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_BAND_SIGMAS),
            insert_sample_size: conf
                .get(path.push("insert_sample_size"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_INSERT_SAMPLE_SIZE),
            rebuild_batch_size: conf
                .get(path.push("rebuild_batch_size"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_REBUILD_BATCH_SIZE),
            drift_rebuild_threshold: conf
                .get(path.push("drift_rebuild_threshold"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_DRIFT_REBUILD_THRESHOLD),
        }
    }
}

impl HistoryConfig {
    fn parse(conf: &Config, path: ConfPath) -> HistoryConfig {
        HistoryConfig {
            max_packages: conf
                .get(path.push("max_packages"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_MAX_PACKAGES),
            package_size: conf
                .get(path.push("package_size"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_PACKAGE_SIZE),
            package_timeout_secs: conf
                .get(path.push("package_timeout_secs"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_PACKAGE_TIMEOUT_SECS),
        }
    }
}

impl RuleConfig {
    fn parse(conf: &Config, path: ConfPath) -> Result<RuleConfig> {
        let rating_policy: Option<String> = conf.get(path.push("rating_policy")).unquote().value().ok();
        let rating_policy = match rating_policy {
            Some(name) => RatingPolicy::from_name(&name)?,
            None => RatingPolicy::default(),
        };

        Ok(RuleConfig {
            min_support: conf
                .get(path.push("min_support"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_MIN_SUPPORT),
            min_confidence: conf
                .get(path.push("min_confidence"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_MIN_CONFIDENCE),
            max_itemset_size: conf
                .get(path.push("max_itemset_size"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_MAX_ITEMSET_SIZE),
            min_package_size: conf
                .get(path.push("min_package_size"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_MIN_PACKAGE_SIZE),
            bidirectional_max_imbalance: conf
                .get(path.push("bidirectional_max_imbalance"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_BIDIRECTIONAL_MAX_IMBALANCE),
            rating_policy,
            max_rules: conf
                .get(path.push("max_rules"))
                .trim()
                .value()
                .unwrap_or(DEFAULT_MAX_RULES),
        })
    }
}

impl Default for RuleConfig {
    fn default() -> Self {
        RuleConfig {
            min_support: DEFAULT_MIN_SUPPORT,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            max_itemset_size: DEFAULT_MAX_ITEMSET_SIZE,
            min_package_size: DEFAULT_MIN_PACKAGE_SIZE,
            bidirectional_max_imbalance: DEFAULT_BIDIRECTIONAL_MAX_IMBALANCE,
            rating_policy: RatingPolicy::default(),
            max_rules: DEFAULT_MAX_RULES,
        }
    }
}

impl WorkerConfig {
    fn parse(conf: &Config, path: ConfPath) -> WorkerConfig {
        WorkerConfig {
            num_workers: conf
                .get(path.push("num_workers"))
                .trim()
                .value()
                // Detect number of CPUs
                .unwrap_or_else(|_| {
                    sys_info::cpu_num()
                        .ok()
                        .and_then(|cpus| cpus.try_into().ok())
                        .unwrap_or(1)
                }),
        }
    }
}
