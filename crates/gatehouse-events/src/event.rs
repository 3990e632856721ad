//! The security event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    RateLimitExceeded,
    CsrfFailure,
    SuspiciousRequest,
    InvalidOrigin,
    IpBlocked,
    AuthFailure,
    SqlInjectionAttempt,
    XssAttempt,
    PathTraversal,
}

impl SecurityEventKind {
    /// Whether the monitor counts this kind toward auto-blocking.
    pub fn is_suspicious(self) -> bool {
        matches!(
            self,
            SecurityEventKind::SuspiciousRequest
                | SecurityEventKind::CsrfFailure
                | SecurityEventKind::AuthFailure
                | SecurityEventKind::SqlInjectionAttempt
                | SecurityEventKind::XssAttempt
                | SecurityEventKind::PathTraversal
        )
    }
}

/// How bad it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What the pipeline did about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityAction {
    Blocked,
    Allowed,
    Monitored,
}

/// A single security observation, emitted by the protection components and
/// dispatched through the [`SecurityEventBus`](crate::SecurityEventBus).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub client_ip: String,
    pub user_agent: String,
    pub request_uri: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub action: SecurityAction,
}

impl SecurityEvent {
    /// Creates an event stamped `now`, with empty request context.
    pub fn new(
        kind: SecurityEventKind,
        severity: Severity,
        action: SecurityAction,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            severity,
            client_ip: String::new(),
            user_agent: String::new(),
            request_uri: String::new(),
            method: String::new(),
            headers: None,
            user_id: None,
            message: message.into(),
            details: None,
            action,
        }
    }

    /// Sets the client address the event is attributed to.
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = ip.into();
        self
    }

    /// Sets the request context (method, URI, user agent).
    pub fn with_request(
        mut self,
        method: impl Into<String>,
        uri: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        self.method = method.into();
        self.request_uri = uri.into();
        self.user_agent = user_agent.into();
        self
    }

    /// Attaches the authenticated user, when known.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_snake_case_tags() {
        let event = SecurityEvent::new(
            SecurityEventKind::SqlInjectionAttempt,
            Severity::High,
            SecurityAction::Blocked,
            "sql injection detected",
        )
        .with_client_ip("203.0.113.7")
        .with_request("POST", "/login", "curl/8.0");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "sql_injection_attempt");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["action"], "blocked");
        assert_eq!(json["client_ip"], "203.0.113.7");
        // Optional fields are omitted when empty.
        assert!(json.get("user_id").is_none());
    }

    #[test]
    fn round_trips_through_json() {
        let event = SecurityEvent::new(
            SecurityEventKind::CsrfFailure,
            Severity::Medium,
            SecurityAction::Blocked,
            "token mismatch",
        )
        .with_user_id("42")
        .with_details(serde_json::json!({"field": "csrf_token"}));

        let json = serde_json::to_string(&event).unwrap();
        let back: SecurityEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, SecurityEventKind::CsrfFailure);
        assert_eq!(back.user_id.as_deref(), Some("42"));
        assert_eq!(back.details, event.details);
    }

    #[test]
    fn suspicious_kinds_feed_the_monitor() {
        assert!(SecurityEventKind::XssAttempt.is_suspicious());
        assert!(SecurityEventKind::CsrfFailure.is_suspicious());
        assert!(!SecurityEventKind::RateLimitExceeded.is_suspicious());
        assert!(!SecurityEventKind::IpBlocked.is_suspicious());
    }
}
