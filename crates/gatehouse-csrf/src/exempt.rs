//! Exemption rules, evaluated in order: method, exact path, glob.

use http::Method;

/// Exemption rules for the validator.
#[derive(Debug, Clone)]
pub struct ExemptRules {
    pub(crate) methods: Vec<Method>,
    pub(crate) paths: Vec<String>,
    pub(crate) globs: Vec<String>,
}

impl Default for ExemptRules {
    fn default() -> Self {
        Self {
            methods: vec![Method::GET, Method::HEAD, Method::OPTIONS],
            paths: Vec::new(),
            globs: Vec::new(),
        }
    }
}

impl ExemptRules {
    /// Whether a request is exempt from validation.
    pub fn is_exempt(&self, method: &Method, path: &str) -> bool {
        if self.methods.contains(method) {
            return true;
        }
        if self.paths.iter().any(|p| p == path) {
            return true;
        }
        self.globs.iter().any(|g| glob_matches(g, path))
    }
}

/// Matches a trailing-`*` glob with prefix-boundary enforcement.
///
/// Only `prefix*` patterns with a non-empty prefix are accepted; the path
/// must equal the prefix or continue it at a `/` boundary. Any `..` in the
/// pattern or the path disqualifies the match, so traversal tricks cannot
/// reach an exemption.
pub(crate) fn glob_matches(pattern: &str, path: &str) -> bool {
    if pattern.contains("..") || path.contains("..") {
        return false;
    }
    let Some(prefix) = pattern.strip_suffix('*') else {
        return false;
    };
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    if prefix.is_empty() {
        return false;
    }
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_methods_are_exempt() {
        let rules = ExemptRules::default();
        assert!(rules.is_exempt(&Method::GET, "/anything"));
        assert!(rules.is_exempt(&Method::HEAD, "/anything"));
        assert!(rules.is_exempt(&Method::OPTIONS, "/anything"));
        assert!(!rules.is_exempt(&Method::POST, "/anything"));
    }

    #[test]
    fn exact_paths_are_exempt() {
        let rules = ExemptRules {
            paths: vec!["/webhooks/github".to_string()],
            ..ExemptRules::default()
        };
        assert!(rules.is_exempt(&Method::POST, "/webhooks/github"));
        assert!(!rules.is_exempt(&Method::POST, "/webhooks/github/x"));
    }

    #[test]
    fn glob_requires_a_boundary() {
        assert!(glob_matches("/api/*", "/api/users"));
        assert!(glob_matches("/api/*", "/api"));
        assert!(glob_matches("/api/*", "/api/v1/users"));
        // Not a prefix at a path boundary.
        assert!(!glob_matches("/api/*", "/apikey"));
    }

    #[test]
    fn traversal_disqualifies_the_match() {
        assert!(!glob_matches("/api/*", "/api/../secret"));
        assert!(!glob_matches("/api/../*", "/api/users"));
    }

    #[test]
    fn only_trailing_star_patterns_match() {
        assert!(!glob_matches("/api", "/api"));
        assert!(!glob_matches("*", "/api"));
        assert!(!glob_matches("/*", "/api"));
        assert!(!glob_matches("", "/api"));
    }
}
