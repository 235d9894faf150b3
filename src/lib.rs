//! labscope - channel resampling and binary codec engine for lab data
//!
//! Decodes multi-channel binary telemetry recordings, computes derived
//! channels, and reduces arbitrarily long channels to a bounded number of
//! plot points with an algorithm picked from the oversampling ratio.
//!
//! # Features
//!
//! - Channel-major binary format with optional per-channel Deflate/Zstd blocks
//! - Range reads resolved from the header alone, without decoding the file
//! - Derived channels (product, sum, difference, magnitude, clamped difference)
//! - Identity, stride, min-max, RMS and LTTB reduction
//! - Single-flight result caches with TTL and capacity bounds
//!
//! # Example
//!
//! ```rust,ignore
//! use labscope::{ChannelService, EngineConfig, SourceRegistry, DataKind, TimeWindow};
//! use std::sync::Arc;
//!
//! # async fn example() -> labscope::Result<()> {
//! let registry = Arc::new(SourceRegistry::new());
//! registry.register("exp-42", DataKind::Telemetry, "/data/exp-42/telemetry.lscp");
//!
//! let service = ChannelService::new(EngineConfig::default(), registry)?;
//! let series = service
//!     .channel("exp-42", "pressure", TimeWindow::between(0.0, 10_000.0), 1000)
//!     .await?;
//! println!("{} points via {}", series.len(), series.algorithm);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod compression;
pub mod config;
pub mod derive;
pub mod error;
pub mod index;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod native;
pub mod resample;
pub mod service;
pub mod stats;
pub mod types;
pub mod utils;

// Re-exports
pub use cache::{CachePolicy, CacheStatus, ResultCache};
pub use codec::{DecodedFile, TelemetryWriter, TELEMETRY_MAGIC};
pub use compression::{CompressionLevel, CompressionMethod};
pub use config::{DerivedChannelDef, EngineConfig};
pub use derive::Formula;
pub use error::{CalcError, CodecError, LabError, Result, ValidationError};
pub use index::{locate, SampleIndexRange, TimeWindow};
pub use io::{DataKind, DirectoryLocator, SourceLocator, SourceRegistry, Stager};
pub use metadata::{ChannelDescriptor, FileHeader};
pub use native::{NativeEngine, TemperatureMapper, ThermalEngine};
pub use resample::{ResamplePolicy, ResampledSeries, ResamplingAlgorithm};
pub use service::{ChannelService, ExperimentMetadata, RescanEvent};
pub use stats::ChannelStatistics;
pub use types::{SampleBuffer, SampleEncoding, SignalClass};

/// Version of the labscope crate
pub const LABSCOPE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!LABSCOPE_VERSION.is_empty());
        assert_eq!(TELEMETRY_MAGIC, b"LSCP");
    }
}
