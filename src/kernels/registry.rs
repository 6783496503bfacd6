//! Process-wide template table
//!
//! Built once on first access. Templates are looked up by name.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

use super::sources;
use super::template::{KernelTemplate, TemplateKind};
use crate::error::{ForgeError, ForgeResult};
use crate::tensor::DType;

/// Reduction passes, in entry-name form
pub const REDUCE_PASSES: [&str; 3] = ["single", "pass1", "pass2"];

static REGISTRY: Lazy<KernelRegistry> = Lazy::new(KernelRegistry::builtin);

#[derive(Debug)]
pub struct KernelRegistry {
    templates: BTreeMap<String, KernelTemplate>,
}

impl KernelRegistry {
    /// The shared built-in registry
    pub fn global() -> &'static KernelRegistry {
        &REGISTRY
    }

    fn builtin() -> Self {
        let mut registry = KernelRegistry {
            templates: BTreeMap::new(),
        };
        registry.register(reduce_template("sum_all", "a + b"));
        registry.register(reduce_template("max_all", "a > b ? a : b"));
        registry.register(reduce_template("min_all", "a < b ? a : b"));
        registry.register(apply_template("fill", 1, sources::fill_source()).with_scalars(1));
        registry.register(apply_template("copy", 2, sources::copy_source()));
        registry.register(apply_template("add", 3, sources::add_source()));
        tracing::debug!("Registered {} kernel templates", registry.templates.len());
        registry
    }

    fn register(&mut self, template: KernelTemplate) {
        self.templates.insert(template.name().to_string(), template);
    }

    pub fn get(&self, name: &str) -> ForgeResult<&KernelTemplate> {
        self.templates
            .get(name)
            .ok_or_else(|| ForgeError::UnknownTemplate(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn templates(&self) -> impl Iterator<Item = &KernelTemplate> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Unsuffixed name of a reduction entry
pub fn reduce_entry(template: &str, pass: &str, dtype: DType) -> String {
    format!("{}_{}_{}", template, pass, dtype.name())
}

/// Unsuffixed name of an elementwise entry
pub fn apply_entry(template: &str, dtype: DType) -> String {
    format!("{}_{}", template, dtype.name())
}

fn reduce_template(name: &str, combine: &str) -> KernelTemplate {
    let entries = REDUCE_PASSES
        .iter()
        .flat_map(|pass| DType::ALL.iter().map(move |&d| reduce_entry(name, pass, d)))
        .collect();
    KernelTemplate::new(
        name,
        TemplateKind::Reduce,
        1,
        entries,
        sources::reduce_source(name, combine),
    )
    .with_scalars(1)
}

fn apply_template(name: &str, arity: usize, source: String) -> KernelTemplate {
    let entries = DType::ALL.iter().map(|&d| apply_entry(name, d)).collect();
    KernelTemplate::new(name, TemplateKind::Apply, arity, entries, source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_templates() {
        let registry = KernelRegistry::global();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["add", "copy", "fill", "max_all", "min_all", "sum_all"]);
        assert_eq!(registry.get("add").unwrap().arity(), 3);
        assert_eq!(registry.get("sum_all").unwrap().kind(), TemplateKind::Reduce);
        assert!(matches!(
            registry.get("softmax"),
            Err(ForgeError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn test_entries_declared_in_source() {
        for template in KernelRegistry::global().templates() {
            for entry in template.entries() {
                assert!(
                    template.source().contains(&format!("TF_KERNEL({})", entry)),
                    "{} missing from {}",
                    entry,
                    template.name()
                );
            }
        }
    }

    #[test]
    fn test_reduce_entry_names() {
        assert_eq!(reduce_entry("max_all", "pass1", DType::F64), "max_all_pass1_f64");
        let sum = KernelRegistry::global().get("sum_all").unwrap();
        assert_eq!(sum.entries().len(), 9);
        assert!(sum.has_entry("sum_all_single_i32"));
    }
}
