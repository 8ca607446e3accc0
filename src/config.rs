use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::backend::StaticRegistry;
use crate::rules::{BulkAnalyzer, GroupingRule, RuleBook, Target};

pub const SUPPORTED_VERSIONS: &[&str] = &["0.1"];

/// Dispatcher configuration: which modules exist, which are active, which of
/// their methods merge, and where calls go.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DispatchConfig {
    pub version: String,

    pub modules: BTreeMap<String, ModuleSpec>,

    #[serde(default)]
    pub backend: BackendSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ModuleSpec {
    #[serde(default = "default_true")]
    pub active: bool,

    /// Method name → grouping rule.
    #[serde(default)]
    pub rules: BTreeMap<String, RuleSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RuleSpec {
    /// Defaults to the owning module.
    #[serde(default)]
    pub target_module: Option<String>,

    /// Defaults to the method the rule is declared for.
    #[serde(default)]
    pub target_method: Option<String>,

    #[serde(default = "default_true")]
    pub merge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BackendSpec {
    #[serde(default = "default_backend_kind")]
    pub kind: String,

    /// Kind-specific settings (`endpoint`, `headers`, `timeout_secs` for http).
    #[serde(default)]
    pub config: HashMap<String, JsonValue>,
}

impl Default for BackendSpec {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            config: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_backend_kind() -> String {
    "echo".to_string()
}

impl DispatchConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_yaml_str(&text)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        crate::schema::validate_config_yaml(text)?;
        let cfg: DispatchConfig = serde_yaml::from_str(text).context("parse config yaml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic checks the schema cannot express.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            return Err(anyhow!(
                "unsupported config version '{}' (supported: {})",
                self.version,
                SUPPORTED_VERSIONS.join(", ")
            ));
        }

        for (module, spec) in &self.modules {
            check_name("module", module)?;
            for (method, rule) in &spec.rules {
                check_name(&format!("modules.{module}.rules key"), method)?;
                if let Some(m) = rule.target_module.as_deref() {
                    check_name(&format!("modules.{module}.rules.{method}.target_module"), m)?;
                }
                if let Some(m) = rule.target_method.as_deref() {
                    check_name(&format!("modules.{module}.rules.{method}.target_method"), m)?;
                }
            }
        }

        let kind = self.backend.kind.trim().to_lowercase();
        if kind != "echo" && kind != "http" {
            return Err(anyhow!(
                "unsupported backend kind '{}' (supported: echo, http)",
                self.backend.kind
            ));
        }
        if kind == "http" && !self.backend.config.contains_key("endpoint") {
            return Err(anyhow!("backend kind 'http' requires backend.config.endpoint"));
        }

        Ok(())
    }

    /// One `BulkAnalyzer` per module that declares rules.
    pub fn rule_book(&self) -> RuleBook {
        let mut book = RuleBook::new();
        for (module, spec) in &self.modules {
            if spec.rules.is_empty() {
                continue;
            }
            let mut analyzer = BulkAnalyzer::new(module.clone());
            for (method, rule) in &spec.rules {
                let target = Target::new(
                    rule.target_module.clone().unwrap_or_else(|| module.clone()),
                    rule.target_method.clone().unwrap_or_else(|| method.clone()),
                );
                analyzer = analyzer.with_rule(GroupingRule {
                    method_name: method.clone(),
                    target,
                    merge_capable: rule.merge,
                });
            }
            book = book.with_analyzer(analyzer);
        }
        book
    }

    pub fn registry(&self) -> StaticRegistry {
        StaticRegistry::new(
            self.modules
                .iter()
                .filter(|(_, spec)| spec.active)
                .map(|(name, _)| name.clone()),
        )
    }
}

fn check_name(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{what} must not be empty"));
    }
    if value.contains('.') {
        return Err(anyhow!("{what} '{value}' must not contain '.'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ModuleRegistry;

    const SAMPLE: &str = r#"
version: "0.1"
modules:
  Actions:
    rules:
      getPageUrls:
        target_method: getPageUrlsBulk
      getOutlinks:
        merge: false
  Goals:
    active: false
backend:
  kind: echo
"#;

    #[test]
    fn sample_config_loads_with_defaults() {
        let cfg = DispatchConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.version, "0.1");
        assert!(cfg.modules["Actions"].active);
        assert!(!cfg.modules["Goals"].active);
        assert!(cfg.modules["Actions"].rules["getPageUrls"].merge);
        assert_eq!(cfg.backend.kind, "echo");
    }

    #[test]
    fn rule_book_fills_in_default_targets() {
        let cfg = DispatchConfig::from_yaml_str(SAMPLE).unwrap();
        let book = cfg.rule_book();
        assert_eq!(book.modules().collect::<Vec<_>>(), vec!["Actions"]);
        assert!(book.source_for("Goals").is_none());

        let raw = crate::request::RawRequest::from_query(
            "bulk=true&method[]=Actions.getPageUrls&method[]=Actions.getOutlinks&method[]=Actions.getPageUrls",
        )
        .unwrap();
        let normalized = crate::normalize::normalize(&raw).unwrap();
        let groups = book
            .source_for("Actions")
            .expect("Actions has rules")
            .analyze_bulk_requests(&normalized.calls);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].indices, vec![0, 2]);
        assert_eq!(groups[0].target, Target::new("Actions", "getPageUrlsBulk"));
    }

    #[test]
    fn registry_only_lists_active_modules() {
        let cfg = DispatchConfig::from_yaml_str(SAMPLE).unwrap();
        let reg = cfg.registry();
        assert!(reg.is_active("Actions"));
        assert!(!reg.is_active("Goals"));
        assert!(!reg.is_active("Unknown"));
    }

    #[test]
    fn backend_defaults_to_echo() {
        let cfg = DispatchConfig::from_yaml_str("version: \"0.1\"\nmodules: {}\n").unwrap();
        assert_eq!(cfg.backend, BackendSpec::default());
    }

    #[test]
    fn rejects_unknown_version() {
        let err = DispatchConfig::from_yaml_str("version: \"9.9\"\nmodules: {}\n").unwrap_err();
        assert!(err.to_string().contains("unsupported config version"), "{err:#}");
    }

    #[test]
    fn rejects_dotted_module_names() {
        let yaml = "version: \"0.1\"\nmodules:\n  \"A.B\": {}\n";
        let err = DispatchConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("must not contain '.'"), "{err:#}");
    }

    #[test]
    fn http_backend_needs_endpoint() {
        let yaml = "version: \"0.1\"\nmodules: {}\nbackend:\n  kind: http\n";
        let err = DispatchConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("endpoint"), "{err:#}");
    }
}
