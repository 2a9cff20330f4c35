use std::io::Write;
use std::sync::{Mutex, OnceLock};

use arbiter_cli::commands::{policy, simulate};
use serde_json::Value;

const POLICY_TOML: &str = r#"
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

const GRAPH_TOML: &str = r#"
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
"#;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn write_temp(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write temp file");
    file
}

fn simulate_args(
    graph: &tempfile::NamedTempFile,
    policy: &tempfile::NamedTempFile,
    json: bool,
) -> simulate::SimulateArgs {
    simulate::SimulateArgs {
        graph: graph.path().to_path_buf(),
        policy: Some(policy.path().to_path_buf()),
        budget_cap: 10.0,
        rpm: 60,
        fail_on_conflict: false,
        max_steps: 100,
        charge_all: false,
        json,
    }
}

#[test]
fn simulate_renders_a_text_report_with_the_capped_conflict() {
    let _guard = env_lock().lock().expect("env lock");
    let graph = write_temp(GRAPH_TOML);
    let policy = write_temp(POLICY_TOML);

    let result = simulate::run(simulate_args(&graph, &policy, false));

    assert_eq!(result.exit_code, 0, "expected successful simulation");
    assert!(result.output.contains("ghost-run"));
    assert!(result.output.contains("frequency_cap_exceeded"));
    assert!(result.output.contains("conflicts: 1"));
}

#[test]
fn simulate_emits_a_structured_json_report() {
    let _guard = env_lock().lock().expect("env lock");
    let graph = write_temp(GRAPH_TOML);
    let policy = write_temp(POLICY_TOML);

    let result = simulate::run(simulate_args(&graph, &policy, true));
    assert_eq!(result.exit_code, 0);

    let report: Value = serde_json::from_str(&result.output).expect("json report");
    assert_eq!(report["steps"].as_array().map(Vec::len), Some(3));
    assert_eq!(report["conflicts"].as_array().map(Vec::len), Some(1));
    assert_eq!(report["complete"], true);
    assert_eq!(report["budget_exceeded"], false);
}

#[test]
fn simulate_fails_cleanly_on_a_malformed_graph() {
    let _guard = env_lock().lock().expect("env lock");
    let graph = write_temp("steps = \"not a list\"");
    let policy = write_temp(POLICY_TOML);

    let result = simulate::run(simulate_args(&graph, &policy, false));

    assert_eq!(result.exit_code, 2);
    let payload: Value = serde_json::from_str(&result.output).expect("json payload");
    assert_eq!(payload["command"], "simulate");
    assert_eq!(payload["error_class"], "invalid_graph");
}

#[test]
fn policy_summarizes_a_valid_document() {
    let _guard = env_lock().lock().expect("env lock");
    let policy = write_temp(POLICY_TOML);

    let result = policy::run(Some(policy.path().to_path_buf()));

    assert_eq!(result.exit_code, 0);
    let payload: Value = serde_json::from_str(&result.output).expect("json payload");
    assert_eq!(payload["command"], "policy");
    assert_eq!(payload["status"], "ok");
}

#[test]
fn policy_rejects_unknown_fields() {
    let _guard = env_lock().lock().expect("env lock");
    let policy = write_temp("version = 1\nsurprise = true\n");

    let result = policy::run(Some(policy.path().to_path_buf()));

    assert_eq!(result.exit_code, 2);
    let payload: Value = serde_json::from_str(&result.output).expect("json payload");
    assert_eq!(payload["error_class"], "invalid_policy");
}
