//! Structured input validation: threat scanning and sanitization over form
//! values.
//!
//! Each value is bounded in length, scanned against the blocked-pattern sets
//! (SQL injection, XSS, path traversal, command injection, LDAP, NoSQL), and
//! sanitized (NUL and control characters stripped, HTML escaped unless
//! allowed, trimmed). In strict mode any detection rejects the input; in
//! lenient mode cleaned values pass through and detections are only
//! reported and emitted as security events.
//!
//! ```
//! use gatehouse_validation::{InputValidator, ValidatorConfig};
//!
//! let validator = ValidatorConfig::builder().strict(true).build().unwrap();
//! let fields = vec![("comment".to_string(), "hello world".to_string())];
//! assert!(validator.validate(&fields).is_ok());
//!
//! let hostile = vec![("q".to_string(), "1' OR '1'='1".to_string())];
//! assert!(validator.validate(&hostile).is_err());
//! ```

mod patterns;
mod sanitize;

pub use patterns::ThreatKind;
pub use sanitize::{escape_html, sanitize};

use gatehouse_core::ConfigError;
use gatehouse_events::{
    SecurityAction, SecurityEvent, SecurityEventKind, SecurityEventBus, Severity,
};
use patterns::BlockedPattern;

/// One detection inside a field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Threat {
    /// The offending field name.
    pub field: String,
    /// The class of injection detected.
    pub kind: ThreatKind,
    /// The pattern that matched.
    pub pattern: String,
    /// Severity of the detection.
    pub severity: Severity,
}

/// Cleaned output of a lenient validation pass.
#[derive(Debug, Clone)]
pub struct Validated {
    /// Sanitized field values, in input order.
    pub fields: Vec<(String, String)>,
    /// Detections found along the way (empty when the input was clean).
    pub threats: Vec<Threat>,
}

/// Why strict validation rejected the input.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationRejection {
    /// One field exceeded the per-field length bound.
    #[error("field {field:?} exceeds {max} bytes")]
    FieldTooLong { field: String, max: usize },
    /// The combined input exceeded the total length bound.
    #[error("input exceeds {max} bytes in total")]
    TotalTooLong { max: usize },
    /// A blocked pattern matched.
    #[error("{kind} detected in field {field:?}")]
    ThreatDetected {
        field: String,
        kind: ThreatKind,
        pattern: String,
    },
}

/// Configuration for the [`InputValidator`].
pub struct ValidatorConfig {
    max_field_length: usize,
    max_total_length: usize,
    allow_html: bool,
    strict: bool,
    bus: Option<SecurityEventBus>,
}

impl ValidatorConfig {
    /// Creates a new builder for configuring the validator.
    pub fn builder() -> ValidatorConfigBuilder {
        ValidatorConfigBuilder::new()
    }
}

/// Builder for [`ValidatorConfig`]; `build` produces the validator itself.
pub struct ValidatorConfigBuilder {
    max_field_length: usize,
    max_total_length: usize,
    allow_html: bool,
    strict: bool,
    bus: Option<SecurityEventBus>,
}

impl Default for ValidatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidatorConfigBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - max_field_length: 10_000 bytes, max_total_length: 100_000 bytes
    /// - HTML escaped, lenient mode
    pub fn new() -> Self {
        Self {
            max_field_length: 10_000,
            max_total_length: 100_000,
            allow_html: false,
            strict: false,
            bus: None,
        }
    }

    /// Per-field length bound in bytes.
    pub fn max_field_length(mut self, max: usize) -> Self {
        self.max_field_length = max;
        self
    }

    /// Cumulative length bound in bytes.
    pub fn max_total_length(mut self, max: usize) -> Self {
        self.max_total_length = max;
        self
    }

    /// Passes HTML through unescaped.
    pub fn allow_html(mut self, allow: bool) -> Self {
        self.allow_html = allow;
        self
    }

    /// In strict mode any detection rejects the whole input.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Emits detections onto the given security event bus.
    pub fn event_bus(mut self, bus: SecurityEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Builds the validator, compiling the pattern sets.
    pub fn build(self) -> Result<InputValidator, ConfigError> {
        if self.max_field_length == 0 {
            return Err(ConfigError::NonPositive {
                field: "max_field_length",
            });
        }
        if self.max_total_length < self.max_field_length {
            return Err(ConfigError::Invalid {
                field: "max_total_length",
                reason: "must be at least max_field_length".to_string(),
            });
        }
        Ok(InputValidator {
            config: ValidatorConfig {
                max_field_length: self.max_field_length,
                max_total_length: self.max_total_length,
                allow_html: self.allow_html,
                strict: self.strict,
                bus: self.bus,
            },
            patterns: patterns::compile_builtin(),
        })
    }
}

/// Scans and sanitizes form values.
pub struct InputValidator {
    config: ValidatorConfig,
    patterns: Vec<BlockedPattern>,
}

impl InputValidator {
    /// Validates a set of parsed form fields.
    ///
    /// Length violations reject in every mode. Pattern detections reject in
    /// strict mode; in lenient mode they are reported on the [`Validated`]
    /// result while sanitized values pass through.
    pub fn validate(
        &self,
        fields: &[(String, String)],
    ) -> Result<Validated, ValidationRejection> {
        self.validate_attributed("", fields)
    }

    /// Same as [`validate`](Self::validate), attributing emitted security
    /// events to `client_ip` so the monitor can count them per address.
    pub fn validate_attributed(
        &self,
        client_ip: &str,
        fields: &[(String, String)],
    ) -> Result<Validated, ValidationRejection> {
        let mut total = 0usize;
        let mut threats = Vec::new();
        let mut cleaned = Vec::with_capacity(fields.len());

        for (name, value) in fields {
            if value.len() > self.config.max_field_length {
                return Err(ValidationRejection::FieldTooLong {
                    field: name.clone(),
                    max: self.config.max_field_length,
                });
            }
            total += value.len();
            if total > self.config.max_total_length {
                return Err(ValidationRejection::TotalTooLong {
                    max: self.config.max_total_length,
                });
            }

            for pattern in &self.patterns {
                if pattern.regex.is_match(value) {
                    let threat = Threat {
                        field: name.clone(),
                        kind: pattern.kind,
                        pattern: pattern.regex.as_str().to_string(),
                        severity: pattern.kind.severity(),
                    };
                    self.emit(client_ip, &threat);
                    if self.config.strict {
                        return Err(ValidationRejection::ThreatDetected {
                            field: threat.field,
                            kind: threat.kind,
                            pattern: threat.pattern,
                        });
                    }
                    threats.push(threat);
                }
            }

            cleaned.push((name.clone(), sanitize(value, self.config.allow_html)));
        }

        Ok(Validated {
            fields: cleaned,
            threats,
        })
    }

    /// Parses an `application/x-www-form-urlencoded` body or query string
    /// into field pairs.
    pub fn parse_form(input: &str) -> Vec<(String, String)> {
        url::form_urlencoded::parse(input.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    fn emit(&self, client_ip: &str, threat: &Threat) {
        tracing::debug!(
            field = %threat.field,
            kind = %threat.kind,
            "blocked pattern matched"
        );
        let Some(bus) = &self.config.bus else { return };

        let kind = match threat.kind {
            ThreatKind::SqlInjection => SecurityEventKind::SqlInjectionAttempt,
            ThreatKind::Xss => SecurityEventKind::XssAttempt,
            ThreatKind::PathTraversal => SecurityEventKind::PathTraversal,
            _ => SecurityEventKind::SuspiciousRequest,
        };
        let action = if self.config.strict {
            SecurityAction::Blocked
        } else {
            SecurityAction::Monitored
        };
        bus.emit(
            SecurityEvent::new(
                kind,
                threat.severity,
                action,
                format!("{} detected in field {:?}", threat.kind, threat.field),
            )
            .with_client_ip(client_ip)
            .with_details(serde_json::json!({
                "field": threat.field,
                "pattern": threat.pattern,
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lenient() -> InputValidator {
        ValidatorConfig::builder().build().unwrap()
    }

    fn strict() -> InputValidator {
        ValidatorConfig::builder().strict(true).build().unwrap()
    }

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn clean_input_passes_both_modes() {
        let input = fields(&[("name", "Alice"), ("age", "30")]);
        assert!(strict().validate(&input).unwrap().threats.is_empty());
        assert!(lenient().validate(&input).unwrap().threats.is_empty());
    }

    #[test]
    fn strict_mode_rejects_injections() {
        let input = fields(&[("q", "1' OR '1'='1")]);
        let err = strict().validate(&input).unwrap_err();
        assert!(matches!(
            err,
            ValidationRejection::ThreatDetected {
                kind: ThreatKind::SqlInjection,
                ..
            }
        ));
    }

    #[test]
    fn lenient_mode_reports_and_sanitizes() {
        let input = fields(&[("comment", "<script>alert(1)</script>")]);
        let validated = lenient().validate(&input).unwrap();
        assert!(validated
            .threats
            .iter()
            .any(|t| t.kind == ThreatKind::Xss));
        // The cleaned value is HTML-escaped.
        assert!(validated.fields[0].1.contains("&lt;script&gt;"));
    }

    #[test]
    fn oversize_fields_reject_in_every_mode() {
        let validator = ValidatorConfig::builder()
            .max_field_length(10)
            .max_total_length(100)
            .build()
            .unwrap();
        let input = fields(&[("big", "aaaaaaaaaaaaaaaaaaaaaa")]);
        assert!(matches!(
            validator.validate(&input),
            Err(ValidationRejection::FieldTooLong { .. })
        ));
    }

    #[test]
    fn cumulative_length_is_bounded() {
        let validator = ValidatorConfig::builder()
            .max_field_length(10)
            .max_total_length(15)
            .build()
            .unwrap();
        let input = fields(&[("a", "aaaaaaaaaa"), ("b", "bbbbbbbbbb")]);
        assert!(matches!(
            validator.validate(&input),
            Err(ValidationRejection::TotalTooLong { .. })
        ));
    }

    #[test]
    fn form_parsing_decodes_pairs() {
        let parsed = InputValidator::parse_form("name=Alice+Smith&note=a%26b");
        assert_eq!(
            parsed,
            vec![
                ("name".to_string(), "Alice Smith".to_string()),
                ("note".to_string(), "a&b".to_string()),
            ]
        );
    }

    #[test]
    fn nul_bytes_are_stripped_from_output() {
        let input = fields(&[("v", "ab\0cd")]);
        let validated = lenient().validate(&input).unwrap();
        assert_eq!(validated.fields[0].1, "abcd");
    }

    #[tokio::test]
    async fn detections_are_emitted_with_attribution() {
        let bus = SecurityEventBus::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = std::sync::Arc::clone(&seen);
        bus.subscribe_fn(move |event| {
            seen_clone
                .lock()
                .unwrap()
                .push((event.kind, event.client_ip.clone()));
        });

        let validator = ValidatorConfig::builder().event_bus(bus).build().unwrap();
        let input = fields(&[("path", "../../etc/passwd")]);
        let _ = validator.validate_attributed("203.0.113.8", &input).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().iter().any(|(kind, ip)| {
            *kind == SecurityEventKind::PathTraversal && ip == "203.0.113.8"
        }));
    }
}
