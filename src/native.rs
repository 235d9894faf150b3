//! Handle to the external native engine
//!
//! The engine is loaded explicitly by the host and passed to whoever needs
//! it. Until it is loaded every lookup fails with
//! [`LabError::EngineNotLoaded`], which callers can report and retry.

use crate::error::{LabError, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Converts raw thermal camera counts to degrees Celsius
pub trait TemperatureMapper: Send + Sync {
    /// Engine name for diagnostics
    fn name(&self) -> &str;

    /// Map one frame of raw sensor counts
    fn to_celsius(&self, raw: &[u16], width: usize, height: usize) -> Result<Vec<f32>>;
}

/// A slot holding an engine that may not be loaded yet
pub struct NativeEngine<T: ?Sized> {
    name: &'static str,
    slot: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> NativeEngine<T> {
    /// An empty slot
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: RwLock::new(None),
        }
    }

    /// A slot that starts loaded
    pub fn loaded(name: &'static str, engine: Arc<T>) -> Self {
        Self {
            name,
            slot: RwLock::new(Some(engine)),
        }
    }

    /// Install (or replace) the engine
    pub fn load(&self, engine: Arc<T>) {
        *self.slot.write() = Some(engine);
        tracing::info!(engine = self.name, "native engine loaded");
    }

    /// Remove the engine; calls already holding it keep their reference
    pub fn unload(&self) -> Option<Arc<T>> {
        let engine = self.slot.write().take();
        if engine.is_some() {
            tracing::info!(engine = self.name, "native engine unloaded");
        }
        engine
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.read().is_some()
    }

    pub fn get(&self) -> Result<Arc<T>> {
        self.slot
            .read()
            .clone()
            .ok_or_else(|| LabError::EngineNotLoaded(self.name.to_string()))
    }
}

impl<T: ?Sized> fmt::Debug for NativeEngine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEngine")
            .field("name", &self.name)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Slot type used for the thermal engine
pub type ThermalEngine = NativeEngine<dyn TemperatureMapper>;

#[cfg(test)]
mod tests {
    use super::*;

    struct LinearMapper;

    impl TemperatureMapper for LinearMapper {
        fn name(&self) -> &str {
            "linear"
        }

        fn to_celsius(&self, raw: &[u16], width: usize, height: usize) -> Result<Vec<f32>> {
            if raw.len() != width * height {
                return Err(LabError::Configuration(format!(
                    "frame of {} counts is not {}x{}",
                    raw.len(),
                    width,
                    height
                )));
            }
            Ok(raw.iter().map(|&c| c as f32 * 0.01 - 273.15).collect())
        }
    }

    #[test]
    fn test_not_loaded_is_recoverable() {
        let engine = ThermalEngine::new("thermal");
        let err = engine.get().err().unwrap();
        assert!(matches!(err, LabError::EngineNotLoaded(ref name) if name == "thermal"));

        engine.load(Arc::new(LinearMapper));
        let mapper = engine.get().unwrap();
        assert_eq!(mapper.name(), "linear");
        let frame = mapper.to_celsius(&[27315, 27415], 2, 1).unwrap();
        assert!((frame[1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_unload_keeps_outstanding_handles() {
        let engine = ThermalEngine::loaded("thermal", Arc::new(LinearMapper));
        let held = engine.get().unwrap();
        assert!(engine.unload().is_some());
        assert!(!engine.is_loaded());
        assert!(held.to_celsius(&[0], 1, 1).is_ok());
        assert!(engine.get().is_err());
    }
}
