use tracing::debug;

use crate::backend::ModuleRegistry;
use crate::error::DispatchError;
use crate::normalize::NormalizedRequest;
use crate::rules::{Group, RuleBook};

/// Buckets call indices into groups using each referenced module's rules.
pub struct GroupingAnalyzer<'a> {
    rules: &'a RuleBook,
    registry: &'a dyn ModuleRegistry,
}

impl<'a> GroupingAnalyzer<'a> {
    pub fn new(rules: &'a RuleBook, registry: &'a dyn ModuleRegistry) -> Self {
        Self { rules, registry }
    }

    /// Fails on the first referenced module that is not active. Groups come
    /// back ordered by module first occurrence, then by method first occurrence
    /// within the module.
    pub fn analyze(&self, request: &NormalizedRequest) -> Result<Vec<Group>, DispatchError> {
        let mut groups = Vec::new();

        for module in &request.modules {
            if !self.registry.is_active(module) {
                return Err(DispatchError::ModuleNotActivated {
                    module: module.clone(),
                });
            }

            let Some(source) = self.rules.source_for(module) else {
                continue;
            };
            let found = source.analyze_bulk_requests(&request.calls);
            debug!(module = %module, groups = found.len(), "analyzed bulk grouping");
            groups.extend(found.into_iter().filter(|g| !g.indices.is_empty()));
        }

        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StaticRegistry;
    use crate::normalize::normalize;
    use crate::request::RawRequest;
    use crate::rules::{BulkAnalyzer, GroupingRule, Target};

    fn book() -> RuleBook {
        RuleBook::new()
            .with_analyzer(BulkAnalyzer::new("A").with_rule(GroupingRule {
                method_name: "m".to_string(),
                target: Target::new("A", "m"),
                merge_capable: true,
            }))
            .with_analyzer(BulkAnalyzer::new("B").with_rule(GroupingRule {
                method_name: "n".to_string(),
                target: Target::new("B", "nBulk"),
                merge_capable: true,
            }))
    }

    fn request(query: &str) -> NormalizedRequest {
        normalize(&RawRequest::from_query(query).unwrap()).unwrap()
    }

    #[test]
    fn collects_groups_across_modules() {
        let book = book();
        let registry = StaticRegistry::new(["A", "B"]);
        let analyzer = GroupingAnalyzer::new(&book, &registry);

        let groups = analyzer
            .analyze(&request("method[]=B.n&method[]=A.m&method[]=B.n&method[]=A.z"))
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].target, Target::new("B", "nBulk"));
        assert_eq!(groups[0].indices, vec![0, 2]);
        assert_eq!(groups[1].indices, vec![1]);
    }

    #[test]
    fn inactive_module_fails() {
        let book = book();
        let registry = StaticRegistry::new(["A"]);
        let analyzer = GroupingAnalyzer::new(&book, &registry);

        let err = analyzer
            .analyze(&request("method[]=A.m&method[]=B.n"))
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::ModuleNotActivated {
                module: "B".to_string()
            }
        );
    }

    #[test]
    fn modules_without_rules_produce_no_groups() {
        let book = book();
        let registry = StaticRegistry::new(["C"]);
        let analyzer = GroupingAnalyzer::new(&book, &registry);
        let groups = analyzer.analyze(&request("method[]=C.m&method[]=C.m")).unwrap();
        assert!(groups.is_empty());
    }
}
