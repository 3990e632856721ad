//! The blocked-pattern sets, one per threat kind.

use gatehouse_events::Severity;
use regex::Regex;
use std::fmt;

/// Classes of injection the scanner recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreatKind {
    SqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
    LdapInjection,
    NoSqlInjection,
}

impl ThreatKind {
    /// Severity assigned to detections of this kind.
    pub fn severity(self) -> Severity {
        match self {
            ThreatKind::CommandInjection => Severity::Critical,
            ThreatKind::SqlInjection | ThreatKind::Xss | ThreatKind::PathTraversal => {
                Severity::High
            }
            ThreatKind::LdapInjection | ThreatKind::NoSqlInjection => Severity::Medium,
        }
    }
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreatKind::SqlInjection => "sql_injection",
            ThreatKind::Xss => "xss",
            ThreatKind::PathTraversal => "path_traversal",
            ThreatKind::CommandInjection => "command_injection",
            ThreatKind::LdapInjection => "ldap_injection",
            ThreatKind::NoSqlInjection => "nosql_injection",
        };
        f.write_str(name)
    }
}

/// A compiled blocked pattern.
pub(crate) struct BlockedPattern {
    pub(crate) kind: ThreatKind,
    pub(crate) regex: Regex,
}

const PATTERN_SOURCES: &[(ThreatKind, &[&str])] = &[
    (
        ThreatKind::SqlInjection,
        &[
            r"(?i)\b(union\s+(all\s+)?select|select\s+[\w\*,\s]+\s+from|insert\s+into|delete\s+from|drop\s+(table|database)|update\s+\w+\s+set)\b",
            r"(?i)'\s*(or|and)\s+'?\d+'?\s*=\s*'?\d+",
            r"(?i)(--\s|/\*|\bxp_cmdshell\b|\bsleep\s*\(|\bbenchmark\s*\()",
        ],
    ),
    (
        ThreatKind::Xss,
        &[
            r"(?i)<\s*script",
            r"(?i)\bjavascript\s*:",
            r"(?i)\bon(load|error|click|mouseover|focus|submit)\s*=",
            r"(?i)<\s*(iframe|object|embed)\b",
        ],
    ),
    (
        ThreatKind::PathTraversal,
        &[
            r"\.\./",
            r"\.\.\\",
            r"(?i)%2e%2e(%2f|%5c|/|\\)",
            r"(?i)/(etc/passwd|etc/shadow|proc/self)",
        ],
    ),
    (
        ThreatKind::CommandInjection,
        &[
            r"(?i)[;&|`]\s*(cat|ls|rm|wget|curl|bash|sh|nc|cmd|powershell)\b",
            r"\$\([^)]*\)",
            r"(?i)\|\s*(id|whoami|uname)\b",
        ],
    ),
    (
        ThreatKind::LdapInjection,
        &[r"\(\s*[&|]\s*\(", r"=\*\)", r"\)\s*\(\s*\w+\s*="],
    ),
    (
        ThreatKind::NoSqlInjection,
        &[
            r"(?i)\$\s*(where|ne|gt|lt|gte|lte|regex|nin|or|and)\b",
            r"(?i)\{\s*\$",
        ],
    ),
];

/// Compiles the built-in pattern set.
///
/// The sources are literals validated by tests, so compilation cannot fail
/// at runtime; a broken pattern is skipped with a warning rather than
/// taking the process down.
pub(crate) fn compile_builtin() -> Vec<BlockedPattern> {
    let mut compiled = Vec::new();
    for (kind, sources) in PATTERN_SOURCES {
        for source in *sources {
            match Regex::new(source) {
                Ok(regex) => compiled.push(BlockedPattern { kind: *kind, regex }),
                Err(err) => {
                    tracing::warn!(pattern = source, %err, "skipping unparsable threat pattern")
                }
            }
        }
    }
    compiled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_pattern_compiles() {
        let total: usize = PATTERN_SOURCES.iter().map(|(_, s)| s.len()).sum();
        assert_eq!(compile_builtin().len(), total);
    }

    fn kinds_matching(value: &str) -> Vec<ThreatKind> {
        compile_builtin()
            .iter()
            .filter(|p| p.regex.is_match(value))
            .map(|p| p.kind)
            .collect()
    }

    #[test]
    fn classic_payloads_are_detected() {
        assert!(kinds_matching("1' OR '1'='1").contains(&ThreatKind::SqlInjection));
        assert!(kinds_matching("UNION SELECT password FROM users")
            .contains(&ThreatKind::SqlInjection));
        assert!(kinds_matching("<script>alert(1)</script>").contains(&ThreatKind::Xss));
        assert!(kinds_matching("javascript:alert(1)").contains(&ThreatKind::Xss));
        assert!(kinds_matching("../../etc/passwd").contains(&ThreatKind::PathTraversal));
        assert!(kinds_matching("x; cat /etc/passwd").contains(&ThreatKind::CommandInjection));
        assert!(kinds_matching("admin)(uid=*)").contains(&ThreatKind::LdapInjection));
        assert!(kinds_matching(r#"{"$where": "1==1"}"#).contains(&ThreatKind::NoSqlInjection));
    }

    #[test]
    fn ordinary_text_is_clean() {
        for value in [
            "Alice Johnson",
            "a perfectly normal comment about databases",
            "user@example.com",
            "1 + 1 = 2",
        ] {
            assert!(kinds_matching(value).is_empty(), "false positive on {value:?}");
        }
    }

    #[test]
    fn severities_rank_command_injection_highest() {
        assert_eq!(ThreatKind::CommandInjection.severity(), Severity::Critical);
        assert!(ThreatKind::SqlInjection.severity() > ThreatKind::LdapInjection.severity());
    }
}
