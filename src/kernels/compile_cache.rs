//! Compiled binary cache
//!
//! One [`CompiledBinaryCache`] per template. Entries are keyed by
//! [`KernelConfig`] value. The map lock is held only while looking up or
//! inserting the per-config cell; compilation runs outside it, and
//! concurrent requests for the same config wait on that cell.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use super::config::KernelConfig;
use super::specialization::Specialization;
use crate::error::ForgeResult;

/// A template compiled for one config
#[derive(Debug)]
pub struct CompiledKernel {
    template: String,
    config: KernelConfig,
    specialization: Specialization,
    binary: Vec<u8>,
}

impl CompiledKernel {
    pub fn new(
        template: &str,
        config: KernelConfig,
        specialization: Specialization,
        binary: Vec<u8>,
    ) -> Self {
        CompiledKernel {
            template: template.to_string(),
            config,
            specialization,
            binary,
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn specialization(&self) -> &Specialization {
        &self.specialization
    }

    pub fn binary(&self) -> &[u8] {
        &self.binary
    }
}

type Slot = Arc<OnceCell<Arc<CompiledKernel>>>;

#[derive(Debug, Default)]
pub struct CompiledBinaryCache {
    entries: Mutex<HashMap<KernelConfig, Slot>>,
}

impl CompiledBinaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached binary for `config`, running `compile` on a miss.
    ///
    /// Only one caller compiles a given config. A failed compile leaves
    /// the slot empty, so the next caller tries again.
    pub fn get_or_compile<F>(
        &self,
        config: &KernelConfig,
        compile: F,
    ) -> ForgeResult<Arc<CompiledKernel>>
    where
        F: FnOnce() -> ForgeResult<CompiledKernel>,
    {
        let slot = {
            let mut entries = self.entries.lock()?;
            Arc::clone(entries.entry(config.clone()).or_default())
        };
        let kernel = slot.get_or_try_init(|| compile().map(Arc::new))?;
        Ok(Arc::clone(kernel))
    }

    pub fn get(&self, config: &KernelConfig) -> Option<Arc<CompiledKernel>> {
        let entries = self.entries.lock().ok()?;
        entries.get(config).and_then(|slot| slot.get().cloned())
    }

    /// Number of successfully compiled configs
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|slot| slot.get().is_some()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
