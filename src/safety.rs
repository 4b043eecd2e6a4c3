use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::protocol::CommandPlan;

/* ============================= RULES ============================= */

/// A single danger-filter rule. The name is surfaced in blocked statuses
/// and episode records so operators can see which rule fired.
pub struct DangerRule {
    pub name: &'static str,
    pattern: Regex,
}

static RULES: LazyLock<Vec<DangerRule>> = LazyLock::new(|| {
    let rule = |name: &'static str, pattern: &str| DangerRule {
        name,
        pattern: Regex::new(pattern).expect("danger rule pattern is valid"),
    };

    vec![
        rule("namespace-delete", r"(?i)delete\s+(--\S+\s+)*(ns|namespaces?)\b"),
        rule("node-delete", r"(?i)delete\s+(--\S+\s+)*(no|nodes?)\b"),
        rule(
            "persistent-volume-delete",
            r"(?i)delete\s+(--\S+\s+)*(pv|persistentvolumes?|pvc|persistentvolumeclaims?)\b",
        ),
        rule("container-exec", r"(?i)\bkubectl\s+(--\S+\s+)*exec\b"),
        rule("recursive-remove", r"(?i)\brm\s+-[a-z]*r[a-z]*\b"),
        rule("node-shell", r"(?i)\b(ssh|nsenter|node-shell|debug\s+node/)\b"),
        rule("delete-all", r"(?i)delete\s+\S+\s+(--\S+\s+)*--all\b"),
        rule("drain-node", r"(?i)\bkubectl\s+(--\S+\s+)*(drain|cordon)\b"),
    ]
});

/* ============================= CHECKS ============================= */

/// Returns the name of the first rule the command matches, if any.
pub fn check_command(command: &str) -> Option<&'static str> {
    RULES
        .iter()
        .find(|r| r.pattern.is_match(command))
        .map(|r| r.name)
}

/// A command stripped from a plan, with the rule that rejected it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedCommand {
    pub command: String,
    pub rule: String,
}

/// Strip dangerous commands from every list of a plan.
///
/// The filtered plan is what leaves the service; the blocked commands are
/// carried alongside so the episode records that the filter fired.
pub fn filter_plan(plan: &CommandPlan) -> (CommandPlan, Vec<BlockedCommand>) {
    let mut blocked = Vec::new();

    let mut strip = |commands: &[String]| -> Vec<String> {
        commands
            .iter()
            .filter(|cmd| match check_command(cmd) {
                Some(rule) => {
                    blocked.push(BlockedCommand {
                        command: (*cmd).clone(),
                        rule: rule.to_string(),
                    });
                    false
                }
                None => true,
            })
            .cloned()
            .collect()
    };

    let filtered = CommandPlan {
        backup_commands: strip(&plan.backup_commands),
        fix_commands: strip(&plan.fix_commands),
        validation_commands: strip(&plan.validation_commands),
        rollback_commands: strip(&plan.rollback_commands),
        manifest: plan.manifest.clone(),
    };

    (filtered, blocked)
}
