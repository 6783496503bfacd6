//! Kernel library
//!
//! Owns the compiler, one [`CompiledBinaryCache`] per registered template
//! and the optional [`DiskCache`]. Turns `(template, operands)` into a
//! compiled binary, and binaries into loaded entry points.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;

use super::compile_cache::{CompiledBinaryCache, CompiledKernel};
use super::config::KernelConfig;
use super::disk_cache::DiskCache;
use super::loaded_cache::{LoadedKernel, LoadedKernelCache};
use super::registry::KernelRegistry;
use super::specialization::{all_specializations, mangled_name, Specialization};
use super::template::KernelTemplate;
use crate::backend::{BackendError, KernelCompiler};
use crate::context::DeviceContext;
use crate::error::{ForgeError, ForgeResult};
use crate::tensor::DeviceTensor;

pub struct KernelLibrary {
    compiler: Arc<dyn KernelCompiler>,
    registry: &'static KernelRegistry,
    caches: HashMap<String, CompiledBinaryCache>,
    disk: Option<DiskCache>,
}

impl KernelLibrary {
    /// Library over the built-in templates
    pub fn new(compiler: Arc<dyn KernelCompiler>) -> Self {
        let registry = KernelRegistry::global();
        let caches = registry
            .names()
            .map(|name| (name.to_string(), CompiledBinaryCache::new()))
            .collect();
        KernelLibrary {
            compiler,
            registry,
            caches,
            disk: None,
        }
    }

    /// Persist binaries under `disk` and consult it before compiling
    pub fn with_disk_cache(mut self, disk: DiskCache) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn disk_cache(&self) -> Option<&DiskCache> {
        self.disk.as_ref()
    }

    pub fn template(&self, name: &str) -> ForgeResult<&KernelTemplate> {
        self.registry.get(name)
    }

    fn cache(&self, template: &str) -> ForgeResult<&CompiledBinaryCache> {
        self.caches
            .get(template)
            .ok_or_else(|| ForgeError::UnknownTemplate(template.to_string()))
    }

    /// Binary of `template` under `config`, compiled at most once per
    /// distinct config
    pub fn compile(
        &self,
        template: &str,
        config: &KernelConfig,
    ) -> ForgeResult<Arc<CompiledKernel>> {
        let tmpl = self.registry.get(template)?;
        tmpl.check(config)?;
        self.cache(template)?
            .get_or_compile(config, || self.build(tmpl, config))
    }

    fn build(
        &self,
        template: &KernelTemplate,
        config: &KernelConfig,
    ) -> ForgeResult<CompiledKernel> {
        let spec = config.to_specialization()?;
        let rendered = template.render(config)?;

        if let Some(disk) = &self.disk {
            if let Some(binary) = disk.load(template.name(), &rendered)? {
                return Ok(CompiledKernel::new(template.name(), config.clone(), spec, binary));
            }
        }

        let program = mangled_name(template.name(), &spec);
        tracing::debug!("Compiling {} with {}", program, config);
        let binary = match self.compiler.compile(&program, &rendered) {
            Ok(binary) => binary,
            Err(BackendError::CompilationFailed { log, .. }) => {
                tracing::error!("Compilation of {} failed: {}", program, log);
                return Err(ForgeError::Compilation {
                    template: template.name().to_string(),
                    entry: program,
                    rendered,
                    log,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(disk) = &self.disk {
            // Best effort; a miss next run just recompiles
            if let Err(e) = disk.store(template.name(), &rendered, &binary) {
                tracing::warn!("Could not persist {}: {}", program, e);
            }
        }
        Ok(CompiledKernel::new(template.name(), config.clone(), spec, binary))
    }

    /// Classify `operands` and compile the matching variant of `template`
    pub fn specialize_and_compile(
        &self,
        template: &str,
        operands: &[&DeviceTensor],
    ) -> ForgeResult<Arc<CompiledKernel>> {
        let tmpl = self.registry.get(template)?;
        if operands.len() != tmpl.arity() {
            return Err(ForgeError::InvalidTensor(format!(
                "template '{}' takes {} operands, got {}",
                template,
                tmpl.arity(),
                operands.len()
            )));
        }
        let spec = Specialization::for_operands(operands)?;
        self.compile(template, &KernelConfig::from_specialization(&spec))
    }

    /// Resolve `entry` of a compiled kernel inside `ctx`
    pub fn load_entry(
        &self,
        loaded: &LoadedKernelCache,
        ctx: &DeviceContext,
        compiled: &CompiledKernel,
        entry: &str,
    ) -> ForgeResult<Arc<LoadedKernel>> {
        let symbol = self
            .registry
            .get(compiled.template())?
            .symbol(entry, compiled.specialization())?;
        loaded.get_or_load(ctx, compiled.binary(), &symbol)
    }

    /// Compile every specialization of `template` in parallel
    pub fn prewarm(&self, template: &str) -> ForgeResult<Vec<Arc<CompiledKernel>>> {
        let arity = self.registry.get(template)?.arity();
        let compiled = all_specializations(arity)
            .par_iter()
            .map(|spec| self.compile(template, &KernelConfig::from_specialization(spec)))
            .collect::<ForgeResult<Vec<_>>>()?;
        tracing::info!("Prewarmed {} variants of '{}'", compiled.len(), template);
        Ok(compiled)
    }

    /// Number of compiled variants of `template`
    pub fn compiled_count(&self, template: &str) -> usize {
        self.caches.get(template).map(|c| c.len()).unwrap_or(0)
    }
}

impl fmt::Debug for KernelLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelLibrary")
            .field("compiler", &self.compiler)
            .field("templates", &self.caches.len())
            .field("disk", &self.disk)
            .finish()
    }
}
