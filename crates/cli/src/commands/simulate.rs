use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use arbiter_core::domain::simulation::WorkflowGraph;
use arbiter_core::ghost::{render_text, CostAttribution, GhostConfig, GhostSimulator};
use arbiter_core::holds::HoldManager;
use arbiter_core::policy::PolicyDocument;
use arbiter_core::BudgetGuard;

use super::{resolve_policy_path, CommandResult};

pub struct SimulateArgs {
    pub graph: PathBuf,
    pub policy: Option<PathBuf>,
    pub budget_cap: f64,
    pub rpm: u32,
    pub fail_on_conflict: bool,
    pub max_steps: usize,
    pub charge_all: bool,
    pub json: bool,
}

pub fn run(args: SimulateArgs) -> CommandResult {
    let policy_path = match resolve_policy_path(args.policy) {
        Ok(path) => path,
        Err(message) => return CommandResult::failure("simulate", "config_validation", message, 2),
    };

    let policy = match PolicyDocument::load(&policy_path) {
        Ok(policy) => Arc::new(policy),
        Err(error) => {
            return CommandResult::failure("simulate", "invalid_policy", error.to_string(), 2)
        }
    };

    let raw_graph = match fs::read_to_string(&args.graph) {
        Ok(raw) => raw,
        Err(error) => {
            return CommandResult::failure(
                "simulate",
                "graph_unreadable",
                format!("could not read `{}`: {error}", args.graph.display()),
                2,
            )
        }
    };
    let graph = match WorkflowGraph::from_toml(&raw_graph) {
        Ok(graph) => graph,
        Err(error) => {
            return CommandResult::failure("simulate", "invalid_graph", error.to_string(), 2)
        }
    };

    let config = GhostConfig {
        budget_cap_usd: args.budget_cap,
        rpm_limit: args.rpm,
        fail_on_conflict: args.fail_on_conflict,
        max_steps: args.max_steps,
        cost_attribution: if args.charge_all {
            CostAttribution::AllSteps
        } else {
            CostAttribution::AdmittedOnly
        },
        ..GhostConfig::default()
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "simulate",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            )
        }
    };

    let report = runtime.block_on(async {
        let holds = Arc::new(HoldManager::new(policy.limits.max_hold_ttl_s));
        let budget = Arc::new(BudgetGuard::new());
        let simulator = GhostSimulator::new(Arc::clone(&policy), holds, budget);
        simulator.simulate(&graph, &config).await
    });

    match report {
        Ok(report) => {
            if args.json {
                match report.to_json() {
                    Ok(json) => CommandResult::raw(json),
                    Err(error) => {
                        CommandResult::failure("simulate", "serialization", error.to_string(), 3)
                    }
                }
            } else {
                CommandResult::raw(render_text(&report))
            }
        }
        Err(error) => CommandResult::failure("simulate", "simulation_failed", error.to_string(), 1),
    }
}
