use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::intent::{Decision, DecisionAction, Intent, IntentScope};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimulationId(pub String);

impl std::fmt::Display for SimulationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One declared step of a workflow graph: the intent it would raise and the
/// estimated unit cost of performing it for real.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowStep {
    pub name: String,
    pub intent_type: String,
    pub resource: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default = "default_scope")]
    pub scope: IntentScope,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

fn default_action() -> String {
    "execute".to_string()
}

fn default_scope() -> IntentScope {
    IntentScope::Write
}

impl WorkflowStep {
    pub fn estimated_cost(&self) -> Decimal {
        Decimal::try_from(self.estimated_cost_usd).unwrap_or(Decimal::ZERO)
    }

    pub fn to_intent(&self, author: &str, ttl_s: u32) -> Intent {
        Intent {
            intent_type: self.intent_type.clone(),
            resource: self.resource.clone(),
            action: self.action.clone(),
            author: author.to_string(),
            scope: self.scope,
            ttl_s,
            meta: self.meta.clone(),
        }
    }
}

/// A directed sequence of steps in declared execution order.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowGraph {
    #[serde(default = "default_graph_author")]
    pub author: String,
    pub steps: Vec<WorkflowStep>,
}

fn default_graph_author() -> String {
    "ghost".to_string()
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("workflow graph declares no steps")]
    Empty,
    #[error("duplicate step name `{0}`")]
    DuplicateStep(String),
    #[error("step `{name}` has an invalid estimated cost `{cost}`")]
    InvalidCost { name: String, cost: f64 },
}

impl WorkflowGraph {
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if self.steps.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(GraphError::DuplicateStep(step.name.clone()));
            }
            if !step.estimated_cost_usd.is_finite()
                || step.estimated_cost_usd < 0.0
                || Decimal::try_from(step.estimated_cost_usd).is_err()
            {
                return Err(GraphError::InvalidCost {
                    name: step.name.clone(),
                    cost: step.estimated_cost_usd,
                });
            }
        }
        Ok(())
    }
}

/// A Hold/Replan/Deny decision observed while walking the graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub step_index: usize,
    pub step_name: String,
    pub resource: String,
    pub action: DecisionAction,
    pub reason: String,
}

/// One walked step: the decision it drew and the cost it was charged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_index: usize,
    pub step_name: String,
    pub resource: String,
    pub decision: Decision,
    pub estimated_cost_usd: Decimal,
    pub charged_usd: Decimal,
}

/// Aggregated result of a ghost-run. Built incrementally during the walk;
/// immutable once the run completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub simulation_id: SimulationId,
    pub steps: Vec<StepOutcome>,
    pub conflicts: Vec<ConflictEntry>,
    pub total_cost_usd: Decimal,
    pub budget_exceeded: bool,
    /// False when the run stopped early (conflict with `fail_on_conflict`,
    /// or the `max_steps` ceiling).
    pub complete: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SimulationReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
