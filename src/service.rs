//! Experiment channel service - the query surface over codec, derivation,
//! resampling and caching

use crate::cache::{CacheStatus, ExperimentScoped, ResultCache};
use crate::codec::{read_channel_range, read_file, read_header};
use crate::config::{DerivedChannelDef, EngineConfig};
use crate::derive::compute;
use crate::error::{CodecError, LabError, Result, ValidationError};
use crate::index::{locate_window, TimeWindow, UniformTimeBase};
use crate::io::{DataKind, SourceLocator, Stager};
use crate::layout::DataLayout;
use crate::metadata::{ChannelDescriptor, ChannelKind, FileHeader};
use crate::native::ThermalEngine;
use crate::resample::{resample, resample_slices, ResampledSeries};
use crate::stats::ChannelStatistics;
use crate::types::SampleBuffer;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Logical resource cached for an experiment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Metadata,
    Overview,
    Parsed,
    Series {
        channel: String,
        start_bits: Option<u64>,
        end_bits: Option<u64>,
        max_points: usize,
    },
    Statistics {
        channel: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub experiment: String,
    pub resource: Resource,
}

impl CacheKey {
    fn new(experiment: &str, resource: Resource) -> Self {
        Self {
            experiment: experiment.to_string(),
            resource,
        }
    }
}

impl ExperimentScoped for CacheKey {
    fn experiment_id(&self) -> &str {
        &self.experiment
    }
}

/// Header and channel list of an experiment's telemetry file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentMetadata {
    pub experiment_id: String,
    pub file_size: u64,
    pub header: Arc<FileHeader>,
    /// Raw channels followed by derived channels
    pub channels: Vec<Arc<ChannelDescriptor>>,
}

impl ExperimentMetadata {
    pub fn channel(&self, id: &str) -> Option<&Arc<ChannelDescriptor>> {
        self.channels.iter().find(|c| c.id == id)
    }
}

/// A fully decoded file with its derived channels
#[derive(Debug)]
pub struct ParsedExperiment {
    pub path: PathBuf,
    pub header: Arc<FileHeader>,
    pub channels: Vec<Arc<ChannelDescriptor>>,
    /// One buffer per entry of `channels`
    pub buffers: Vec<Arc<SampleBuffer>>,
}

impl ParsedExperiment {
    pub fn buffer(&self, channel_id: &str) -> Result<&Arc<SampleBuffer>> {
        self.channels
            .iter()
            .position(|c| c.id == channel_id)
            .map(|i| &self.buffers[i])
            .ok_or_else(|| CodecError::ChannelNotFound(channel_id.to_string()).into())
    }
}

/// Invalidation signal from the external rescan workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescanEvent {
    Experiment(String),
    All,
}

struct ServiceInner {
    config: Arc<EngineConfig>,
    locator: Arc<dyn SourceLocator>,
    stager: Stager,
    thermal: Arc<ThermalEngine>,
    parsed: ResultCache<CacheKey, ParsedExperiment>,
    metadata: ResultCache<CacheKey, ExperimentMetadata>,
    overview: ResultCache<CacheKey, Vec<ResampledSeries>>,
    series: ResultCache<CacheKey, ResampledSeries>,
    statistics: ResultCache<CacheKey, ChannelStatistics>,
}

/// Channel queries for experiments, backed by shared caches.
///
/// Cloning is cheap; clones share caches and configuration.
#[derive(Clone)]
pub struct ChannelService {
    inner: Arc<ServiceInner>,
}

impl ChannelService {
    pub fn new(config: EngineConfig, locator: Arc<dyn SourceLocator>) -> Result<Self> {
        Self::with_thermal_engine(config, locator, Arc::new(ThermalEngine::new("thermal")))
    }

    /// Build a service sharing an externally owned thermal engine slot
    pub fn with_thermal_engine(
        config: EngineConfig,
        locator: Arc<dyn SourceLocator>,
        thermal: Arc<ThermalEngine>,
    ) -> Result<Self> {
        config.validate()?;
        let ttl = config.ttl_policy();
        let inner = ServiceInner {
            stager: config.stager(),
            parsed: ResultCache::new("parsed", config.parsed_policy()),
            metadata: ResultCache::new("metadata", ttl),
            overview: ResultCache::new("overview", ttl),
            series: ResultCache::new("series", ttl.with_capacity(config.series_capacity)),
            statistics: ResultCache::new("statistics", ttl),
            config: Arc::new(config),
            locator,
            thermal,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Slot of the native thermal engine
    pub fn thermal_engine(&self) -> &Arc<ThermalEngine> {
        &self.inner.thermal
    }

    /// Header and channel list, read without decoding sample data
    pub async fn metadata(&self, experiment_id: &str) -> Result<Arc<ExperimentMetadata>> {
        self.inner.metadata(experiment_id).await
    }

    /// Every channel reduced to the configured overview size
    pub async fn overview(&self, experiment_id: &str) -> Result<Arc<Vec<ResampledSeries>>> {
        let inner = Arc::clone(&self.inner);
        let experiment = experiment_id.to_string();
        self.inner
            .overview
            .get_or_compute(CacheKey::new(experiment_id, Resource::Overview), move || async move {
                let parsed = inner.parsed(&experiment).await?;
                let points = inner.config.overview_points;
                let config = Arc::clone(&inner.config);
                tokio::task::spawn_blocking(move || {
                    parsed
                        .buffers
                        .iter()
                        .map(|buffer| -> Result<ResampledSeries> {
                            let class = config.signal_class(buffer.channel_id());
                            Ok(resample(buffer, None, points, &config.resample, class)?)
                        })
                        .collect::<Result<Vec<_>>>()
                })
                .await?
            })
            .await
    }

    /// One channel, optionally restricted to a time window
    pub async fn channel(
        &self,
        experiment_id: &str,
        channel_id: &str,
        window: TimeWindow,
        max_points: usize,
    ) -> Result<Arc<ResampledSeries>> {
        self.validate_max_points(max_points)?;
        window.validate()?;

        let key = CacheKey::new(
            experiment_id,
            Resource::Series {
                channel: channel_id.to_string(),
                start_bits: window.start_ms.map(f64::to_bits),
                end_bits: window.end_ms.map(f64::to_bits),
                max_points,
            },
        );
        let inner = Arc::clone(&self.inner);
        let experiment = experiment_id.to_string();
        let channel = channel_id.to_string();
        self.inner
            .series
            .get_or_compute(key, move || async move {
                inner.series(&experiment, &channel, window, max_points).await
            })
            .await
    }

    /// Several channels over the same window, keyed by channel id
    pub async fn bulk_channels(
        &self,
        experiment_id: &str,
        channel_ids: &[String],
        window: TimeWindow,
        max_points: usize,
    ) -> Result<BTreeMap<String, Arc<ResampledSeries>>> {
        if channel_ids.is_empty() {
            return Err(ValidationError::NoChannels.into());
        }
        self.validate_max_points(max_points)?;
        window.validate()?;

        let unique: HashSet<&str> = channel_ids.iter().map(String::as_str).collect();
        let requests = unique.into_iter().map(|channel_id| async move {
            let series = self.channel(experiment_id, channel_id, window, max_points).await?;
            Ok::<_, LabError>((channel_id.to_string(), series))
        });
        Ok(try_join_all(requests).await?.into_iter().collect())
    }

    /// Summary statistics over a whole channel
    pub async fn channel_statistics(
        &self,
        experiment_id: &str,
        channel_id: &str,
    ) -> Result<Arc<ChannelStatistics>> {
        let key = CacheKey::new(
            experiment_id,
            Resource::Statistics {
                channel: channel_id.to_string(),
            },
        );
        let inner = Arc::clone(&self.inner);
        let experiment = experiment_id.to_string();
        let channel = channel_id.to_string();
        self.inner
            .statistics
            .get_or_compute(key, move || async move {
                let parsed = inner.parsed(&experiment).await?;
                let buffer = Arc::clone(parsed.buffer(&channel)?);
                Ok(tokio::task::spawn_blocking(move || ChannelStatistics::from_buffer(&buffer)).await?)
            })
            .await
    }

    /// Drop everything cached for one experiment
    pub fn clear_cache(&self, experiment_id: &str) -> usize {
        let inner = &self.inner;
        let removed = inner.parsed.invalidate(experiment_id)
            + inner.metadata.invalidate(experiment_id)
            + inner.overview.invalidate(experiment_id)
            + inner.series.invalidate(experiment_id)
            + inner.statistics.invalidate(experiment_id);
        tracing::info!(experiment = experiment_id, removed, "cleared experiment cache");
        removed
    }

    /// Drop everything cached for every experiment
    pub fn clear_all_cache(&self) -> usize {
        let inner = &self.inner;
        let removed = inner.parsed.invalidate_all()
            + inner.metadata.invalidate_all()
            + inner.overview.invalidate_all()
            + inner.series.invalidate_all()
            + inner.statistics.invalidate_all();
        tracing::info!(removed, "cleared all caches");
        removed
    }

    pub fn cache_status(&self) -> Vec<CacheStatus> {
        let inner = &self.inner;
        vec![
            inner.parsed.status(),
            inner.metadata.status(),
            inner.overview.status(),
            inner.series.status(),
            inner.statistics.status(),
        ]
    }

    /// Drop expired entries from every cache
    pub fn purge_expired(&self) -> usize {
        let inner = &self.inner;
        inner.parsed.purge_expired()
            + inner.metadata.purge_expired()
            + inner.overview.purge_expired()
            + inner.series.purge_expired()
            + inner.statistics.purge_expired()
    }

    /// Apply rescan signals until the sender side is dropped
    pub fn listen_for_rescans(&self, mut events: mpsc::Receiver<RescanEvent>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    RescanEvent::Experiment(id) => {
                        service.clear_cache(&id);
                    }
                    RescanEvent::All => {
                        service.clear_all_cache();
                    }
                }
            }
            tracing::debug!("rescan channel closed");
        })
    }

    fn validate_max_points(&self, max_points: usize) -> Result<()> {
        let limit = self.inner.config.max_points_limit;
        if max_points == 0 || max_points > limit {
            return Err(ValidationError::MaxPoints {
                requested: max_points,
                limit,
            }
            .into());
        }
        Ok(())
    }
}

impl ServiceInner {
    async fn locate(&self, experiment_id: &str) -> Result<PathBuf> {
        self.locator.locate(experiment_id, DataKind::Telemetry).await
    }

    async fn metadata(self: &Arc<Self>, experiment_id: &str) -> Result<Arc<ExperimentMetadata>> {
        let inner = Arc::clone(self);
        let experiment = experiment_id.to_string();
        self.metadata
            .get_or_compute(CacheKey::new(experiment_id, Resource::Metadata), move || async move {
                let path = inner.locate(&experiment).await?;
                let file_size = tokio::fs::metadata(&path).await?.len();
                let header = Arc::new(read_header(&path).await?);
                let channels = resolve_channels(&header, &inner.config.derived_channels);
                Ok(ExperimentMetadata {
                    experiment_id: experiment,
                    file_size,
                    header,
                    channels,
                })
            })
            .await
    }

    async fn parsed(self: &Arc<Self>, experiment_id: &str) -> Result<Arc<ParsedExperiment>> {
        let inner = Arc::clone(self);
        let experiment = experiment_id.to_string();
        self.parsed
            .get_or_compute(CacheKey::new(experiment_id, Resource::Parsed), move || async move {
                let started = Instant::now();
                let path = inner.locate(&experiment).await?;
                let decoded = read_file(&path, &inner.stager).await?;
                let header = decoded.header;
                let channels = resolve_channels(&header, &inner.config.derived_channels);

                let raw = decoded.buffers;
                let derived_from = channels.clone();
                let buffers =
                    tokio::task::spawn_blocking(move || derive_buffers(&derived_from, raw)).await??;

                tracing::info!(
                    experiment = %experiment,
                    channels = channels.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "parsed experiment"
                );
                Ok(ParsedExperiment {
                    path,
                    header,
                    channels,
                    buffers,
                })
            })
            .await
    }

    async fn series(
        self: &Arc<Self>,
        experiment_id: &str,
        channel_id: &str,
        window: TimeWindow,
        max_points: usize,
    ) -> Result<ResampledSeries> {
        let class = self.config.signal_class(channel_id);
        let parsed_key = CacheKey::new(experiment_id, Resource::Parsed);

        if !window.is_open() && self.parsed.peek(&parsed_key).is_none() {
            let metadata = self.metadata(experiment_id).await?;
            if metadata.file_size >= self.config.partial_read_min_bytes
                && metadata.header.compression.is_seekable()
            {
                let path = self.locate(experiment_id).await?;
                return self
                    .partial_series(&path, &metadata, channel_id, window, max_points)
                    .await;
            }
        }

        let parsed = self.parsed(experiment_id).await?;
        let buffer = Arc::clone(parsed.buffer(channel_id)?);
        let policy = self.config.resample;
        let series = tokio::task::spawn_blocking(move || {
            resample(&buffer, Some(&window), max_points, &policy, class)
        })
        .await??;
        Ok(series)
    }

    /// Read only the samples inside `window`, straight from the file
    async fn partial_series(
        &self,
        path: &Path,
        metadata: &ExperimentMetadata,
        channel_id: &str,
        window: TimeWindow,
        max_points: usize,
    ) -> Result<ResampledSeries> {
        let header = &metadata.header;
        let descriptor = metadata
            .channel(channel_id)
            .ok_or_else(|| CodecError::ChannelNotFound(channel_id.to_string()))?;
        let sources = match &descriptor.kind {
            ChannelKind::Raw => vec![descriptor.index],
            ChannelKind::Derived { sources, .. } => sources.clone(),
        };

        let time_base = UniformTimeBase::for_channel(header, descriptor);
        let samples = locate_window(&time_base, &window);
        if samples.is_empty() {
            return Ok(ResampledSeries::empty(channel_id, true));
        }

        let layout = DataLayout::from_header(header);
        let reads = sources.iter().map(|&source| {
            let layout = &layout;
            async move {
                let bytes = layout
                    .sample_byte_range(source, samples)?
                    .ok_or_else(|| CodecError::InvalidByteRange("block is compressed".to_string()))?;
                read_channel_range(path, header, source, bytes).await
            }
        });
        let inputs = try_join_all(reads).await?;

        let buffer = match &descriptor.kind {
            ChannelKind::Raw => inputs.into_iter().next().ok_or_else(|| {
                CodecError::ChannelNotFound(channel_id.to_string())
            })?,
            ChannelKind::Derived { formula, .. } => {
                let refs: Vec<&SampleBuffer> = inputs.iter().collect();
                compute(formula, channel_id, &refs)?
            }
        };

        tracing::debug!(
            channel = channel_id,
            start = samples.start,
            samples = samples.len(),
            "partial channel read"
        );
        let class = self.config.signal_class(channel_id);
        let series = resample_slices(
            channel_id,
            buffer.times(),
            buffer.values(),
            max_points,
            &self.config.resample,
            class,
        );
        Ok(if samples.is_full(time_base.len) {
            series
        } else {
            series.into_subrange()
        })
    }
}

/// Raw channels of `header` followed by every resolvable derived channel.
///
/// A derived channel is left out (with a warning) when a source is missing
/// or its sources were recorded at different rates.
pub fn resolve_channels(
    header: &FileHeader,
    defs: &[DerivedChannelDef],
) -> Vec<Arc<ChannelDescriptor>> {
    let mut channels = header.channels.clone();
    for def in defs {
        let formula = match def.formula() {
            Ok(formula) => formula,
            Err(e) => {
                tracing::warn!(channel = %def.id, error = %e, "skipping derived channel");
                continue;
            }
        };
        if channels.iter().any(|c| c.id == def.id) {
            tracing::warn!(channel = %def.id, "derived channel id shadows an existing channel");
            continue;
        }
        let sources: Option<Vec<&Arc<ChannelDescriptor>>> =
            def.sources.iter().map(|id| header.channel_by_id(id)).collect();
        let Some(sources) = sources.filter(|s| !s.is_empty()) else {
            tracing::warn!(channel = %def.id, sources = ?def.sources, "derived channel source missing");
            continue;
        };
        let first = sources[0];
        if sources.iter().any(|s| s.downsampling != first.downsampling) {
            tracing::warn!(channel = %def.id, "derived channel sources use different time bases");
            continue;
        }

        channels.push(Arc::new(ChannelDescriptor {
            index: channels.len(),
            id: def.id.clone(),
            label: def.label.clone(),
            unit: def.unit.clone(),
            kind: ChannelKind::Derived {
                sources: sources.iter().map(|s| s.index).collect(),
                formula,
            },
            downsampling: first.downsampling,
            sample_count: first.sample_count,
            stored_len: 0,
            scale: 1.0,
            offset: 0.0,
        }));
    }
    channels
}

/// Append computed buffers for the derived entries of `channels`
fn derive_buffers(
    channels: &[Arc<ChannelDescriptor>],
    mut buffers: Vec<Arc<SampleBuffer>>,
) -> Result<Vec<Arc<SampleBuffer>>> {
    for descriptor in channels.iter().skip(buffers.len()) {
        let ChannelKind::Derived { sources, formula } = &descriptor.kind else {
            continue;
        };
        let inputs = sources
            .iter()
            .map(|&i| {
                buffers
                    .get(i)
                    .map(Arc::as_ref)
                    .ok_or_else(|| crate::error::CalcError::UnknownSource(format!("index {}", i)))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let derived = compute(formula, &descriptor.id, &inputs)?;
        buffers.push(Arc::new(derived));
    }
    Ok(buffers)
}
