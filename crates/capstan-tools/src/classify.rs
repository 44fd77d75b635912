//! Command classifier - risk scoring and category inference per tool call
//!
//! Pure function over (tool metadata, stringified input). Risk starts at
//! the tool's declared baseline and only escalates as patterns match.

use crate::tool::{Tool, ToolCategory};
use capstan_core::RiskLevel;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

/// Classification verdict for one tool call.
#[derive(Clone, Debug)]
pub struct Classification {
    pub risk_level: RiskLevel,
    pub category: ToolCategory,
    pub requires_approval: bool,
    pub warnings: Vec<String>,
    pub reasoning: String,
    pub matched_patterns: Vec<String>,
}

struct DangerPattern {
    name: &'static str,
    regex: Regex,
    risk: RiskLevel,
    category: Option<ToolCategory>,
    warning: &'static str,
}

fn pattern(
    name: &'static str,
    re: &str,
    risk: RiskLevel,
    category: Option<ToolCategory>,
    warning: &'static str,
) -> DangerPattern {
    DangerPattern {
        name,
        // Patterns are static and known-good; a bad one is a programmer error.
        regex: Regex::new(re).unwrap(),
        risk,
        category,
        warning,
    }
}

/// The safety-critical pattern table. Matched against the stringified tool
/// input; risk escalates to the highest matching level.
static DANGEROUS_PATTERNS: Lazy<Vec<DangerPattern>> = Lazy::new(|| {
    vec![
        pattern(
            "recursive_delete",
            r"(?i)rm\s+(-[a-z]*[rf][a-z]*\s+)+|rmdir\s+/s|shutil\.rmtree|del\s+/[sq]",
            RiskLevel::Critical,
            Some(ToolCategory::FileDelete),
            "recursive or forced deletion",
        ),
        pattern(
            "destructive_root_target",
            r#"(?i)\b(rm|rmdir|unlink)\b[^;|&"]*\s(/\*?|~/?)("|\s|$)"#,
            RiskLevel::Critical,
            Some(ToolCategory::FileDelete),
            "deletion targets a filesystem root or home directory",
        ),
        pattern(
            "system_path_write",
            r"(?i)(/etc/|/usr/|/boot/|/sbin/|/bin/|/var/spool|C:\\Windows)",
            RiskLevel::High,
            Some(ToolCategory::FileWrite),
            "touches a system path",
        ),
        pattern(
            "arbitrary_code_execution",
            r"(?i)\b(eval|exec)\s*\(|curl[^|;]*\|\s*(ba|z)?sh|wget[^|;]*\|\s*(ba|z)?sh|python\d?\s+-c\s",
            RiskLevel::Critical,
            Some(ToolCategory::SystemCommand),
            "arbitrary code execution",
        ),
        pattern(
            "credential_access",
            r"(?i)\.ssh/|id_rsa|id_ed25519|\.aws/|\.env\b|credentials|api[_-]?key|private[_ ]key|keychain|/etc/shadow",
            RiskLevel::High,
            None,
            "reads or writes credential material",
        ),
        pattern(
            "privilege_escalation",
            r"(?i)\bsudo\b|\bdoas\b|\bchmod\s+[0-7]*7[0-7]*\s|chown\s+root",
            RiskLevel::High,
            Some(ToolCategory::SystemCommand),
            "privilege escalation",
        ),
        pattern(
            "shell_metacharacters",
            r"(?:;|&&|\|\||`|\$\()",
            RiskLevel::Medium,
            None,
            "shell metacharacters may chain commands",
        ),
    ]
});

/// Classify a tool call. `tool` is the registry entry when the tool is
/// known; unknown tools get a Medium floor so nothing unrecognized slips
/// through silently.
pub fn classify(tool: Option<&Arc<dyn Tool>>, name: &str, input: &Value) -> Classification {
    let (mut risk, mut category) = match tool {
        Some(t) => (t.baseline_risk(), t.category()),
        None => (RiskLevel::Medium, ToolCategory::Other),
    };
    let mut warnings = Vec::new();
    let mut matched = Vec::new();
    let mut reasoning = format!(
        "baseline {} from category {} for '{}'",
        risk,
        category.as_str(),
        name
    );

    let haystack = input.to_string();
    for p in DANGEROUS_PATTERNS.iter() {
        if p.regex.is_match(&haystack) {
            matched.push(p.name.to_string());
            warnings.push(p.warning.to_string());
            if p.risk > risk {
                risk = p.risk;
                reasoning.push_str(&format!("; escalated to {} by {}", p.risk, p.name));
            }
            if let Some(cat) = p.category {
                category = cat;
            }
        }
    }

    if let Some(host) = non_allowlisted_host(&haystack) {
        matched.push("outbound_network".to_string());
        warnings.push(format!("outbound network access to {}", host));
        if RiskLevel::Medium > risk {
            risk = RiskLevel::Medium;
            reasoning.push_str("; escalated to medium by outbound_network");
        }
        category = ToolCategory::Network;
    }

    Classification {
        risk_level: risk,
        category,
        requires_approval: risk.requires_approval(),
        warnings,
        reasoning,
        matched_patterns: matched,
    }
}

static URL_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)https?://([\w.:\[\]-]+)").unwrap());

const HOST_ALLOWLIST: &[&str] = &["localhost", "127.0.0.1", "[::1]", "0.0.0.0"];

/// First URL host in the input that is not on the local allowlist.
fn non_allowlisted_host(haystack: &str) -> Option<String> {
    for caps in URL_HOST.captures_iter(haystack) {
        let raw = &caps[1];
        // Strip the port; bracketed IPv6 hosts keep their brackets.
        let host = if raw.starts_with('[') {
            match raw.find(']') {
                Some(end) => &raw[..=end],
                None => raw,
            }
        } else {
            raw.split(':').next().unwrap_or(raw)
        };
        if !HOST_ALLOWLIST.contains(&host) {
            return Some(host.to_string());
        }
    }
    None
}
