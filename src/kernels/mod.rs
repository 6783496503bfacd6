//! Kernel specialization and caching
//!
//! This module turns generic templates into device code:
//! - `specialization`: classify operands by index width and contiguity
//! - `config`: macro sets realizing one specialization
//! - `template`/`registry`: the built-in templates and their entry points
//! - `compile_cache`/`disk_cache`: get-or-compile, in memory and on disk
//! - `loaded_cache`: per-context module loading
//! - `library`: ties the above together

pub mod compile_cache;
pub mod config;
pub mod disk_cache;
pub mod library;
pub mod loaded_cache;
pub mod registry;
mod sources;
pub mod specialization;
pub mod template;

pub use compile_cache::{CompiledBinaryCache, CompiledKernel};
pub use config::{operand_macro, KernelConfig, INDEX_TYPE_MACRO};
pub use disk_cache::DiskCache;
pub use library::KernelLibrary;
pub use loaded_cache::{LoadedKernel, LoadedKernelCache};
pub use registry::{apply_entry, reduce_entry, KernelRegistry, REDUCE_PASSES};
pub use specialization::{
    all_specializations, mangled_name, IndexWidth, Specialization, TensorClass, U32_INDEX_LIMIT,
};
pub use template::{KernelTemplate, TemplateKind};
