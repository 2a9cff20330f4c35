use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::budget::{BudgetError, BudgetGuard};
use crate::domain::budget::BudgetState;
use crate::domain::intent::{DecisionAction, META_BUDGET_ID};
use crate::domain::simulation::{
    ConflictEntry, GraphError, SimulationId, SimulationReport, StepOutcome, WorkflowGraph,
};
use crate::engine::{DecisionEngine, InMemoryDecisionLog};
use crate::holds::HoldManager;
use crate::policy::PolicyDocument;

/// Cost attribution for steps that are not admitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostAttribution {
    /// Only admitted steps are charged their estimate.
    #[default]
    AdmittedOnly,
    /// Every walked step is charged, denied or not.
    AllSteps,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GhostConfig {
    pub budget_cap_usd: f64,
    pub rpm_limit: u32,
    pub fail_on_conflict: bool,
    pub max_steps: usize,
    /// TTL applied to every simulated intent.
    pub step_ttl_s: u32,
    pub cost_attribution: CostAttribution,
}

impl Default for GhostConfig {
    fn default() -> Self {
        Self {
            budget_cap_usd: 10.0,
            rpm_limit: 60,
            fail_on_conflict: false,
            max_steps: 100,
            step_ttl_s: 90,
            cost_attribution: CostAttribution::AdmittedOnly,
        }
    }
}

#[derive(Debug, Error)]
pub enum GhostError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("invalid simulation config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Budget(#[from] BudgetError),
}

/// Non-executing replay of a workflow's intents through the decision engine.
///
/// Shares the live policy, hold, and budget components so predicted
/// conflicts reflect current state, but scopes every run to its own budget
/// session and decision log, and hands back every hold it acquired.
pub struct GhostSimulator {
    policy: Arc<PolicyDocument>,
    holds: Arc<HoldManager>,
    budget: Arc<BudgetGuard>,
}

impl GhostSimulator {
    pub fn new(
        policy: Arc<PolicyDocument>,
        holds: Arc<HoldManager>,
        budget: Arc<BudgetGuard>,
    ) -> Self {
        Self { policy, holds, budget }
    }

    pub async fn simulate(
        &self,
        graph: &WorkflowGraph,
        config: &GhostConfig,
    ) -> Result<SimulationReport, GhostError> {
        graph.validate()?;
        let budget_cap = Decimal::try_from(config.budget_cap_usd).map_err(|_| {
            GhostError::InvalidConfig(format!("budget cap `{}` is not representable", config.budget_cap_usd))
        })?;
        if config.max_steps == 0 {
            return Err(GhostError::InvalidConfig("max_steps must be positive".to_string()));
        }

        let simulation_id = SimulationId(format!("ghost_{}", Uuid::new_v4().simple()));
        let session = self
            .budget
            .start(
                budget_cap,
                config.rpm_limit,
                BTreeMap::from([("ghost_run".to_string(), simulation_id.0.clone())]),
            )
            .await?;

        let log = Arc::new(InMemoryDecisionLog::default());
        let engine = DecisionEngine::new(
            Arc::clone(&self.policy),
            Arc::clone(&self.holds),
            Arc::clone(&self.budget),
            log,
        );

        let started_at = Utc::now();
        let mut steps = Vec::new();
        let mut conflicts = Vec::new();
        let mut acquired_tokens: BTreeSet<String> = BTreeSet::new();
        let mut total_cost = Decimal::ZERO;
        let mut complete = true;

        for (index, step) in graph.steps.iter().enumerate() {
            if index >= config.max_steps {
                complete = false;
                break;
            }

            let mut intent = step.to_intent(&graph.author, config.step_ttl_s);
            intent.meta.insert(META_BUDGET_ID.to_string(), session.id.0.clone());

            let decision = match engine.decide(&intent).await {
                Ok(decision) => decision,
                Err(error) => {
                    // A faulted step never discards the partial report.
                    conflicts.push(ConflictEntry {
                        step_index: index,
                        step_name: step.name.clone(),
                        resource: step.resource.clone(),
                        action: DecisionAction::Deny,
                        reason: error.to_string(),
                    });
                    complete = false;
                    break;
                }
            };

            if let Some(token) = decision.hold_token.clone() {
                acquired_tokens.insert(token);
            }

            let is_conflict = decision.action != DecisionAction::Accept;
            if is_conflict {
                conflicts.push(ConflictEntry {
                    step_index: index,
                    step_name: step.name.clone(),
                    resource: step.resource.clone(),
                    action: decision.action,
                    reason: decision.reason.clone(),
                });
            }

            let estimated = step.estimated_cost();
            let should_charge = match config.cost_attribution {
                CostAttribution::AdmittedOnly => decision.is_admitted(),
                CostAttribution::AllSteps => true,
            };
            let mut charged = Decimal::ZERO;
            if should_charge && estimated > Decimal::ZERO {
                let outcome = self.budget.consume(&session.id.0, estimated).await?;
                if outcome.allowed {
                    charged = estimated;
                    total_cost += estimated;
                }
            }

            steps.push(StepOutcome {
                step_index: index,
                step_name: step.name.clone(),
                resource: step.resource.clone(),
                decision,
                estimated_cost_usd: estimated,
                charged_usd: charged,
            });

            if config.fail_on_conflict && is_conflict {
                complete = false;
                break;
            }
        }

        // Ghost-runs leave no trace in the hold queues.
        for token in acquired_tokens {
            let _ = self.holds.release(&token).await;
        }

        let budget_exceeded = self
            .budget
            .info(&session.id.0)
            .await
            .map(|snapshot| snapshot.state == BudgetState::Stopped)
            .unwrap_or(false);
        let _ = self.budget.stop(&session.id.0).await;

        Ok(SimulationReport {
            simulation_id,
            steps,
            conflicts,
            total_cost_usd: total_cost,
            budget_exceeded,
            complete,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Human-readable projection of a structured report. Pure rendering, no
/// decision logic.
pub fn render_text(report: &SimulationReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "ghost-run {}", report.simulation_id);
    let _ = writeln!(
        out,
        "status: {} | steps: {} | conflicts: {} | total cost: ${} | budget exceeded: {}",
        if report.complete { "complete" } else { "incomplete" },
        report.steps.len(),
        report.conflicts.len(),
        report.total_cost_usd,
        if report.budget_exceeded { "yes" } else { "no" },
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "steps:");
    for step in &report.steps {
        let _ = writeln!(
            out,
            "  {:>3}. {:<24} {:<7} {:<24} est ${} charged ${}",
            step.step_index + 1,
            step.step_name,
            step.decision.action.as_str(),
            step.decision.reason,
            step.estimated_cost_usd,
            step.charged_usd,
        );
    }

    if report.conflicts.is_empty() {
        let _ = writeln!(out, "\nno conflicts detected");
    } else {
        let _ = writeln!(out, "\nconflicts:");
        for conflict in &report.conflicts {
            let _ = writeln!(
                out,
                "  step {} `{}` on {}: {} ({})",
                conflict.step_index + 1,
                conflict.step_name,
                conflict.resource,
                conflict.action.as_str(),
                conflict.reason,
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use crate::budget::BudgetGuard;
    use crate::domain::intent::{reason, DecisionAction};
    use crate::domain::simulation::WorkflowGraph;
    use crate::holds::HoldManager;
    use crate::policy::PolicyDocument;

    use super::{render_text, CostAttribution, GhostConfig, GhostSimulator};

    const POLICY: &str = r#"
        version = 1

        [frequency_caps."contact.email"]
        window_hours = 48
        max_count = 1

        [limits]
        replan_limit = 2
        max_hold_ttl_s = 3600
        default_hold_ttl_s = 120
        replan_queue_depth = 3
    "#;

    fn build_simulator() -> (GhostSimulator, Arc<HoldManager>, Arc<BudgetGuard>) {
        let policy = Arc::new(PolicyDocument::from_toml(POLICY).expect("valid policy"));
        let holds = Arc::new(HoldManager::new(policy.limits.max_hold_ttl_s));
        let budget = Arc::new(BudgetGuard::new());
        let simulator =
            GhostSimulator::new(policy, Arc::clone(&holds), Arc::clone(&budget));
        (simulator, holds, budget)
    }

    /// Step 2 re-raises step 1's capped intent type on the same resource, so
    /// it is denied by the frequency cap; step 3 is unrelated.
    fn capped_graph() -> WorkflowGraph {
        WorkflowGraph::from_toml(
            r#"
            author = "ghost"

            [[steps]]
            name = "first_email"
            intent_type = "contact.email"
            resource = "contact:42/email"
            estimated_cost_usd = 0.10

            [[steps]]
            name = "second_email"
            intent_type = "contact.email"
            resource = "contact:42/email"
            estimated_cost_usd = 0.20

            [[steps]]
            name = "log_note"
            intent_type = "crm.note"
            resource = "contact:42/notes"
            estimated_cost_usd = 0.40
            "#,
        )
        .expect("parse graph")
    }

    #[tokio::test]
    async fn capped_step_is_a_conflict_and_charges_admitted_steps_only() {
        let (simulator, _, _) = build_simulator();
        let report = simulator
            .simulate(&capped_graph(), &GhostConfig::default())
            .await
            .expect("simulate");

        assert!(report.complete);
        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].step_name, "second_email");
        assert_eq!(report.conflicts[0].reason, reason::FREQUENCY_CAP_EXCEEDED);

        // 0.10 + 0.40; the denied step contributes nothing.
        assert_eq!(report.total_cost_usd, Decimal::new(50, 2));
        assert!(!report.budget_exceeded);
    }

    #[tokio::test]
    async fn all_steps_attribution_charges_denied_steps_too() {
        let (simulator, _, _) = build_simulator();
        let config =
            GhostConfig { cost_attribution: CostAttribution::AllSteps, ..GhostConfig::default() };

        let report = simulator.simulate(&capped_graph(), &config).await.expect("simulate");

        assert_eq!(report.total_cost_usd, Decimal::new(70, 2));
    }

    #[tokio::test]
    async fn fail_on_conflict_stops_early_with_an_incomplete_report() {
        let (simulator, _, _) = build_simulator();
        let config = GhostConfig { fail_on_conflict: true, ..GhostConfig::default() };

        let report = simulator.simulate(&capped_graph(), &config).await.expect("simulate");

        assert!(!report.complete);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.steps.last().map(|step| step.decision.action), Some(DecisionAction::Deny));
    }

    #[tokio::test]
    async fn budget_cap_stops_simulated_spend() {
        let (simulator, _, _) = build_simulator();
        let config = GhostConfig { budget_cap_usd: 0.25, ..GhostConfig::default() };

        let report = simulator.simulate(&capped_graph(), &config).await.expect("simulate");

        // Step 1 charges 0.10; step 3's 0.40 breaches the 0.25 cap.
        assert!(report.budget_exceeded);
        assert_eq!(report.total_cost_usd, Decimal::new(10, 2));
        assert_eq!(report.steps[2].charged_usd, Decimal::ZERO);
    }

    #[tokio::test]
    async fn ghost_runs_release_every_hold_they_acquired() {
        let (simulator, holds, _) = build_simulator();
        simulator
            .simulate(&capped_graph(), &GhostConfig::default())
            .await
            .expect("simulate");

        assert_eq!(holds.active_count().await, 0);
        assert_eq!(holds.pending_count().await, 0);
    }

    #[tokio::test]
    async fn max_steps_bounds_the_walk() {
        let (simulator, _, _) = build_simulator();
        let config = GhostConfig { max_steps: 1, ..GhostConfig::default() };

        let report = simulator.simulate(&capped_graph(), &config).await.expect("simulate");

        assert!(!report.complete);
        assert_eq!(report.steps.len(), 1);
    }

    #[tokio::test]
    async fn text_rendering_is_a_pure_projection() {
        let (simulator, _, _) = build_simulator();
        let report = simulator
            .simulate(&capped_graph(), &GhostConfig::default())
            .await
            .expect("simulate");

        let first = render_text(&report);
        let second = render_text(&report);

        assert_eq!(first, second);
        assert!(first.contains(&report.simulation_id.0));
        assert!(first.contains("frequency_cap_exceeded"));
        assert!(first.contains("total cost: $0.5"));
    }
}
