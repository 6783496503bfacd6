//! Kernel templates
//!
//! A template is generic HIP source plus the list of macros it needs. It
//! only becomes compilable once a [`KernelConfig`] supplies exactly those
//! macros.

use super::config::{operand_macro, KernelConfig, INDEX_TYPE_MACRO};
use super::specialization::{mangled_name, Specialization};
use crate::error::{ForgeError, ForgeResult};

/// Shape of the entry points a template exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    /// `{name}_{single,pass1,pass2}_{dtype}` over one input operand
    Reduce,
    /// `{name}_{dtype}` over all operands elementwise
    Apply,
}

#[derive(Debug, Clone)]
pub struct KernelTemplate {
    name: String,
    kind: TemplateKind,
    arity: usize,
    scalars: usize,
    entries: Vec<String>,
    required_macros: Vec<String>,
    source: String,
}

impl KernelTemplate {
    /// Template over `arity` operands; requires `INDEX_TYPE` and one
    /// operand macro per operand.
    pub fn new(
        name: &str,
        kind: TemplateKind,
        arity: usize,
        entries: Vec<String>,
        source: String,
    ) -> Self {
        let mut required_macros = vec![INDEX_TYPE_MACRO.to_string()];
        required_macros.extend((0..arity).map(operand_macro));
        required_macros.sort();
        KernelTemplate {
            name: name.to_string(),
            kind,
            arity,
            scalars: 0,
            entries,
            required_macros,
            source,
        }
    }

    /// Declare `scalars` by-value parameters following the operands
    pub fn with_scalars(mut self, scalars: usize) -> Self {
        self.scalars = scalars;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn scalars(&self) -> usize {
        self.scalars
    }

    /// Unsuffixed entry point names
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn has_entry(&self, entry: &str) -> bool {
        self.entries.iter().any(|e| e == entry)
    }

    pub fn required_macros(&self) -> &[String] {
        &self.required_macros
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Reject configs that omit a required macro or define an undeclared one
    pub fn check(&self, config: &KernelConfig) -> ForgeResult<()> {
        let missing: Vec<String> = self
            .required_macros
            .iter()
            .filter(|m| config.get(m).is_none())
            .cloned()
            .collect();
        let extra: Vec<String> = config
            .macro_names()
            .filter(|name| !self.required_macros.iter().any(|m| m == name))
            .map(str::to_string)
            .collect();
        if missing.is_empty() && extra.is_empty() {
            Ok(())
        } else {
            Err(ForgeError::KernelConfigMismatch {
                template: self.name.clone(),
                missing,
                extra,
            })
        }
    }

    /// Source ready for compilation: the config's defines, the suffix
    /// definition, then the template body.
    pub fn render(&self, config: &KernelConfig) -> ForgeResult<String> {
        self.check(config)?;
        let spec = config.to_specialization()?;
        Ok(format!(
            "{}#define KERNEL_SUFFIX {}\n{}",
            config.defines(),
            spec.suffix(),
            self.source
        ))
    }

    /// Exported symbol of `entry` under `spec`
    pub fn symbol(&self, entry: &str, spec: &Specialization) -> ForgeResult<String> {
        if !self.has_entry(entry) {
            return Err(ForgeError::UnknownEntry {
                template: self.name.clone(),
                entry: entry.to_string(),
            });
        }
        Ok(mangled_name(entry, spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{IndexWidth, TensorClass};

    fn two_operand() -> KernelTemplate {
        KernelTemplate::new(
            "pair",
            TemplateKind::Apply,
            2,
            vec!["pair_f32".to_string()],
            "// body\n".to_string(),
        )
    }

    #[test]
    fn test_required_macros() {
        assert_eq!(two_operand().required_macros(), &["DIMSA", "DIMSB", "INDEX_TYPE"]);
    }

    #[test]
    fn test_missing_and_extra_macros_rejected() {
        let template = two_operand();
        let missing = KernelConfig::new()
            .with_macro("INDEX_TYPE", "uint32_t")
            .with_macro("DIMSA", "-2");
        match template.check(&missing) {
            Err(ForgeError::KernelConfigMismatch { missing, extra, .. }) => {
                assert_eq!(missing, vec!["DIMSB".to_string()]);
                assert!(extra.is_empty());
            }
            other => panic!("expected mismatch, got {:?}", other),
        }

        let extra = missing.clone().with_macro("DIMSB", "-1").with_macro("UNROLL", "4");
        match template.check(&extra) {
            Err(ForgeError::KernelConfigMismatch { missing, extra, .. }) => {
                assert!(missing.is_empty());
                assert_eq!(extra, vec!["UNROLL".to_string()]);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_render_prepends_defines_and_suffix() {
        let spec = Specialization::new(
            IndexWidth::U32,
            vec![TensorClass::FullyContiguous, TensorClass::Generic],
        );
        let rendered = two_operand()
            .render(&KernelConfig::from_specialization(&spec))
            .unwrap();
        assert!(rendered
            .starts_with("#define DIMSA -2\n#define DIMSB -1\n#define INDEX_TYPE uint32_t\n"));
        assert!(rendered.contains("#define KERNEL_SUFFIX _u32_cg\n"));
        assert!(rendered.ends_with("// body\n"));
    }

    #[test]
    fn test_symbol() {
        let template = two_operand();
        let spec = Specialization::new(IndexWidth::U64, vec![TensorClass::Generic; 2]);
        assert_eq!(template.symbol("pair_f32", &spec).unwrap(), "pair_f32_u64_gg");
        assert!(matches!(
            template.symbol("pair_f64", &spec),
            Err(ForgeError::UnknownEntry { .. })
        ));
    }
}
