//! Engine configuration

use crate::cache::CachePolicy;
use crate::derive::Formula;
use crate::error::{LabError, Result};
use crate::io::Stager;
use crate::resample::ResamplePolicy;
use crate::types::SignalClass;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration of a [`ChannelService`](crate::service::ChannelService)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lifetime of metadata, overview, series and statistics entries
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Number of fully decoded files kept in memory
    pub parsed_capacity: usize,

    /// Number of resampled series kept (besides the TTL)
    pub series_capacity: usize,

    /// Points per channel in the overview
    pub overview_points: usize,

    /// Largest `max_points` a caller may request
    pub max_points_limit: usize,

    /// Windowed queries on files at least this large read only the requested
    /// range instead of decoding the whole file
    pub partial_read_min_bytes: u64,

    pub resample: ResamplePolicy,

    pub staging: StagingConfig,

    /// Channels computed from raw channels after every decode
    pub derived_channels: Vec<DerivedChannelDef>,

    /// Signal class per channel id; unlisted channels use `default_signal_class`
    pub signal_classes: HashMap<String, SignalClass>,

    pub default_signal_class: SignalClass,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            parsed_capacity: 4,
            series_capacity: 512,
            overview_points: 5000,
            max_points_limit: 100_000,
            partial_read_min_bytes: 64 * 1024 * 1024,
            resample: ResamplePolicy::default(),
            staging: StagingConfig::default(),
            derived_channels: Vec::new(),
            signal_classes: HashMap::new(),
            default_signal_class: SignalClass::default(),
        }
    }
}

/// Local staging of files on network shares
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Directory receiving staged copies; staging is off when unset
    pub dir: Option<PathBuf>,
    /// Path prefixes treated as network locations (e.g. `//` or `/mnt/lab`)
    pub network_prefixes: Vec<String>,
}

/// A derived channel computed from named raw channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedChannelDef {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub unit: String,
    /// Formula id, e.g. `product` or `clamped_difference`
    pub formula: String,
    #[serde(default)]
    pub params: Vec<f64>,
    /// Raw channel ids, in formula argument order
    pub sources: Vec<String>,
}

impl DerivedChannelDef {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        unit: impl Into<String>,
        formula: impl Into<String>,
        sources: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            unit: unit.into(),
            formula: formula.into(),
            params: Vec::new(),
            sources,
        }
    }

    pub fn with_params(mut self, params: Vec<f64>) -> Self {
        self.params = params;
        self
    }

    pub fn formula(&self) -> Result<Formula> {
        Ok(Formula::from_id(&self.formula, &self.params)?)
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_parsed_capacity(mut self, capacity: usize) -> Self {
        self.parsed_capacity = capacity;
        self
    }

    pub fn with_series_capacity(mut self, capacity: usize) -> Self {
        self.series_capacity = capacity;
        self
    }

    pub fn with_overview_points(mut self, points: usize) -> Self {
        self.overview_points = points;
        self
    }

    pub fn with_max_points_limit(mut self, limit: usize) -> Self {
        self.max_points_limit = limit;
        self
    }

    pub fn with_partial_read_min_bytes(mut self, bytes: u64) -> Self {
        self.partial_read_min_bytes = bytes;
        self
    }

    pub fn with_resample_policy(mut self, policy: ResamplePolicy) -> Self {
        self.resample = policy;
        self
    }

    pub fn with_staging(mut self, dir: impl Into<PathBuf>, network_prefixes: Vec<String>) -> Self {
        self.staging = StagingConfig {
            dir: Some(dir.into()),
            network_prefixes,
        };
        self
    }

    pub fn with_derived_channel(mut self, def: DerivedChannelDef) -> Self {
        self.derived_channels.push(def);
        self
    }

    pub fn with_signal_class(mut self, channel_id: impl Into<String>, class: SignalClass) -> Self {
        self.signal_classes.insert(channel_id.into(), class);
        self
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            LabError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(LabError::Configuration(msg));
        if self.max_points_limit == 0 {
            return invalid("max_points_limit must be at least 1".to_string());
        }
        if self.overview_points == 0 || self.overview_points > self.max_points_limit {
            return invalid(format!(
                "overview_points must be between 1 and {}, got {}",
                self.max_points_limit, self.overview_points
            ));
        }
        if self.parsed_capacity == 0 || self.series_capacity == 0 {
            return invalid("cache capacities must be at least 1".to_string());
        }
        if !self.resample.is_valid() {
            return invalid(format!(
                "resample thresholds must satisfy 1 <= stride ({}) <= minmax ({})",
                self.resample.stride_threshold, self.resample.minmax_threshold
            ));
        }
        if self.staging.dir.is_none() && !self.staging.network_prefixes.is_empty() {
            return invalid("network_prefixes need a staging dir".to_string());
        }

        let mut ids = HashSet::new();
        for def in &self.derived_channels {
            if !ids.insert(def.id.as_str()) {
                return invalid(format!("derived channel {} defined twice", def.id));
            }
            if def.sources.is_empty() {
                return invalid(format!("derived channel {} has no sources", def.id));
            }
            def.formula()
                .map_err(|e| LabError::Configuration(format!("derived channel {}: {}", def.id, e)))?;
        }
        Ok(())
    }

    /// Signal class of a channel
    pub fn signal_class(&self, channel_id: &str) -> SignalClass {
        self.signal_classes
            .get(channel_id)
            .copied()
            .unwrap_or(self.default_signal_class)
    }

    /// Policy for the cheap per-query caches
    pub fn ttl_policy(&self) -> CachePolicy {
        CachePolicy::ttl(self.cache_ttl)
    }

    /// Policy for the decoded-file cache
    pub fn parsed_policy(&self) -> CachePolicy {
        CachePolicy::capacity(self.parsed_capacity).with_ttl(self.cache_ttl)
    }

    pub fn stager(&self) -> Stager {
        match &self.staging.dir {
            Some(dir) => Stager::new(dir.clone(), self.staging.network_prefixes.clone()),
            None => Stager::disabled(),
        }
    }
}
