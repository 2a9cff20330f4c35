use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use arbiter_core::budget::BudgetGuard;
use arbiter_core::config::AppConfig;
use arbiter_core::engine::DecisionEngine;
use arbiter_core::holds::HoldManager;
use arbiter_core::ledger::IdempotencyLedger;
use arbiter_core::policy::PolicyDocument;
use arbiter_db::{
    connect_with_settings, migrations, BudgetAuditRepository, HoldAuditRepository, SqlDecisionLog,
};

use crate::routes::AppState;

pub struct App {
    pub config: AppConfig,
    pub state: AppState,
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<App> {
    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .with_context(|| format!("could not connect to database `{}`", config.database.url))?;

    migrations::run_pending(&db_pool).await.context("could not apply database migrations")?;

    let policy = Arc::new(
        PolicyDocument::load(&config.policy.path)
            .with_context(|| format!("could not load policy `{}`", config.policy.path.display()))?,
    );

    info!(
        event_name = "system.bootstrap.policy_loaded",
        correlation_id = "bootstrap",
        policy_version = policy.version,
        frequency_caps = policy.frequency_caps.len(),
        approval_rules = policy.approvals.len(),
        "policy snapshot loaded"
    );

    let holds = Arc::new(HoldManager::new(policy.limits.max_hold_ttl_s));
    let budget = Arc::new(BudgetGuard::new());
    let ledger = Arc::new(IdempotencyLedger::new());
    let decision_log = Arc::new(SqlDecisionLog::new(db_pool.clone()));

    let log: Arc<dyn arbiter_core::engine::DecisionLog> = decision_log.clone();
    let engine = Arc::new(DecisionEngine::new(
        Arc::clone(&policy),
        Arc::clone(&holds),
        Arc::clone(&budget),
        log,
    ));

    let state = AppState {
        policy,
        engine,
        holds: Arc::clone(&holds),
        budget,
        ledger: Arc::clone(&ledger),
        decision_log,
        hold_audit: Arc::new(HoldAuditRepository::new(db_pool.clone())),
        budget_audit: Arc::new(BudgetAuditRepository::new(db_pool.clone())),
        db_pool,
    };

    spawn_reaper(Arc::clone(&holds), ledger, config.reaper.interval_secs);

    Ok(App { config, state })
}

/// Time-driven sweep: expires overdue holds, promotes queued waiters, and
/// bounds idempotency ledger memory.
fn spawn_reaper(holds: Arc<HoldManager>, ledger: Arc<IdempotencyLedger>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let now = Utc::now();
            let outcome = holds.sweep_expired(now).await;
            let expired_records = ledger.sweep_expired(now).await;

            if !outcome.expired.is_empty() || !outcome.promoted.is_empty() || expired_records > 0 {
                info!(
                    event_name = "system.reaper.sweep",
                    correlation_id = "reaper",
                    expired_holds = outcome.expired.len(),
                    promoted_holds = outcome.promoted.len(),
                    expired_effect_records = expired_records,
                    "reaper cycle completed"
                );
            }
        }
    });
}
