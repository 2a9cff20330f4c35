use std::path::PathBuf;

use arbiter_core::policy::PolicyDocument;

use super::{resolve_policy_path, CommandResult};

pub fn run(path: Option<PathBuf>) -> CommandResult {
    let policy_path = match resolve_policy_path(path) {
        Ok(path) => path,
        Err(message) => return CommandResult::failure("policy", "config_validation", message, 2),
    };

    match PolicyDocument::load(&policy_path) {
        Ok(policy) => {
            let suppressed: Vec<&str> = policy.suppressed_types().into_iter().collect();
            CommandResult::success(
                "policy",
                format!(
                    "policy version {} valid: {} frequency caps, {} approval rules, {} suppressed types",
                    policy.version,
                    policy.frequency_caps.len(),
                    policy.approvals.len(),
                    suppressed.len(),
                ),
            )
        }
        Err(error) => CommandResult::failure("policy", "invalid_policy", error.to_string(), 2),
    }
}
