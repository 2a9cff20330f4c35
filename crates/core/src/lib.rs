pub mod budget;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod ghost;
pub mod holds;
pub mod ledger;
pub mod policy;

pub use budget::{BudgetError, BudgetGuard};
pub use domain::budget::{BudgetSession, BudgetSessionId, BudgetState, ConsumeOutcome};
pub use domain::effect::{ClaimState, EffectRecord};
pub use domain::hold::{Hold, HoldState, HoldToken};
pub use domain::intent::{Decision, DecisionAction, Intent, IntentScope};
pub use domain::simulation::{
    ConflictEntry, SimulationId, SimulationReport, StepOutcome, WorkflowGraph, WorkflowStep,
};
pub use engine::{DecisionEngine, DecisionLog, EngineError, InMemoryDecisionLog};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use ghost::{render_text, CostAttribution, GhostConfig, GhostError, GhostSimulator};
pub use holds::{HoldError, HoldGrant, HoldManager, SweepOutcome};
pub use ledger::{
    ClaimOutcome, ClaimStatus, EffectOutcome, EffectRunner, IdempotencyLedger, LedgerError,
};
pub use policy::{PolicyDocument, PolicyError};
