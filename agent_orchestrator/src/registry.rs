//! Capability registry: which agent kinds handle which task types.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::info;

use crate::error::{OrchestratorError, Result};
use crate::settings::AgentKindConfig;
use crate::task::TaskType;

/// A registered class of agent with a fixed capability set and pool capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentKind {
    pub name: String,
    pub task_types: Vec<TaskType>,
    pub max_instances: usize,
    /// Lower values are preferred when several kinds are capable.
    pub priority: u32,
    pub instructions: Option<String>,
}

impl AgentKind {
    pub fn new(name: impl Into<String>, task_types: &[&str], max_instances: usize) -> Self {
        Self {
            name: name.into(),
            task_types: task_types.iter().map(|t| TaskType::from(*t)).collect(),
            max_instances,
            priority: 0,
            instructions: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn supports(&self, task_type: &TaskType) -> bool {
        self.task_types.contains(task_type)
    }

    pub fn is_general(&self) -> bool {
        self.supports(&TaskType::General)
    }
}

impl From<&AgentKindConfig> for AgentKind {
    fn from(cfg: &AgentKindConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            task_types: cfg.task_types.iter().map(|t| TaskType::from(t.as_str())).collect(),
            max_instances: cfg.max_instances,
            priority: cfg.priority,
            instructions: cfg.instructions.clone(),
        }
    }
}

/// Immutable after construction; kinds are held in routing-preference order.
#[derive(Debug)]
pub struct CapabilityRegistry {
    kinds: Vec<Arc<AgentKind>>,
}

impl CapabilityRegistry {
    pub fn new(kinds: Vec<AgentKind>) -> Result<Self> {
        let mut seen = HashSet::new();
        for kind in &kinds {
            if !seen.insert(kind.name.clone()) {
                return Err(OrchestratorError::Config(format!(
                    "agent kind '{}' registered twice",
                    kind.name
                )));
            }
            if kind.max_instances == 0 {
                return Err(OrchestratorError::Config(format!(
                    "agent kind '{}' has zero capacity",
                    kind.name
                )));
            }
        }

        let mut kinds: Vec<Arc<AgentKind>> = kinds.into_iter().map(Arc::new).collect();
        // stable sort keeps declaration order among equal priorities
        kinds.sort_by_key(|k| k.priority);

        info!("Capability registry loaded with {} agent kinds", kinds.len());
        Ok(Self { kinds })
    }

    pub fn from_settings(configs: &[AgentKindConfig]) -> Result<Self> {
        Self::new(configs.iter().map(AgentKind::from).collect())
    }

    /// Kinds able to handle `task_type`, most preferred first.
    pub fn capable_kinds(&self, task_type: &TaskType) -> Vec<Arc<AgentKind>> {
        self.kinds
            .iter()
            .filter(|k| k.supports(task_type))
            .cloned()
            .collect()
    }

    pub fn fallback_kinds(&self) -> Vec<Arc<AgentKind>> {
        self.capable_kinds(&TaskType::General)
    }

    pub fn kind(&self, name: &str) -> Option<Arc<AgentKind>> {
        self.kinds.iter().find(|k| k.name == name).cloned()
    }

    pub fn kinds(&self) -> &[Arc<AgentKind>] {
        &self.kinds
    }

    /// Every task type some kind declares.
    pub fn task_types(&self) -> BTreeSet<TaskType> {
        self.kinds
            .iter()
            .flat_map(|k| k.task_types.iter().cloned())
            .collect()
    }

    pub fn is_known(&self, task_type: &TaskType) -> bool {
        self.kinds.iter().any(|k| k.supports(task_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new(vec![
            AgentKind::new("Generalist", &["general"], 4).with_priority(10),
            AgentKind::new("MetricsB", &["metrics_report"], 1).with_priority(1),
            AgentKind::new("MetricsA", &["metrics_report", "crm_sync"], 2).with_priority(1),
            AgentKind::new("Crm", &["crm_sync"], 2),
        ])
        .unwrap()
    }

    #[test]
    fn test_capable_kinds_in_priority_then_declaration_order() {
        let reg = registry();
        let names: Vec<_> = reg
            .capable_kinds(&TaskType::named("metrics_report"))
            .iter()
            .map(|k| k.name.clone())
            .collect();
        assert_eq!(names, vec!["MetricsB", "MetricsA"]);

        let crm: Vec<_> = reg
            .capable_kinds(&TaskType::named("crm_sync"))
            .iter()
            .map(|k| k.name.clone())
            .collect();
        assert_eq!(crm, vec!["Crm", "MetricsA"]);
    }

    #[test]
    fn test_unknown_type_has_no_capable_kind() {
        let reg = registry();
        assert!(reg.capable_kinds(&TaskType::named("translate")).is_empty());
        assert!(!reg.is_known(&TaskType::named("translate")));
        assert_eq!(reg.fallback_kinds()[0].name, "Generalist");
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let err = CapabilityRegistry::new(vec![
            AgentKind::new("A", &["x"], 1),
            AgentKind::new("A", &["y"], 1),
        ])
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn test_from_default_settings() {
        let settings = crate::settings::Settings::default();
        let reg = CapabilityRegistry::from_settings(&settings.agents).unwrap();
        assert_eq!(reg.kinds().len(), 3);
        assert!(reg.task_types().contains(&TaskType::General));
        assert_eq!(reg.kind("CrmAgent").unwrap().max_instances, 2);
    }
}
