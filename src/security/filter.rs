//! Redaction of sensitive content in events.

use dashmap::DashSet;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use super::patterns::{apply_all, RedactionPatternSet};
use crate::config::SecurityConfig;
use crate::error::{Result, TollgateError};
use crate::event::Attributes;
use crate::sampling::Severity;

/// Key names treated as sensitive out of the box.
const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
    // authentication
    "password", "passwd", "pwd", "secret", "token", "auth", "authorization",
    "api_key", "apikey", "access_key", "private_key", "public_key", "key",
    "jwt", "bearer", "oauth", "session", "cookie", "csrf",
    // personal data
    "ssn", "social_security", "passport", "license", "credit_card", "cc_number",
    "account_number", "routing_number", "iban", "swift", "email", "phone",
    "address", "birth_date", "birthday", "dob",
    // database credentials
    "db_password", "database_password", "connection_string", "dsn",
    "username", "user", "login", "credentials",
    // application secrets
    "encryption_key", "signing_key", "hmac_key", "salt", "hash",
    "client_secret", "client_id", "app_secret", "webhook_secret",
    // infrastructure
    "aws_secret", "aws_access_key", "gcp_key", "azure_key",
    "docker_auth", "k8s_secret", "tls_key", "ssl_key",
];

/// Words that mark free text as sensitive.
const SENSITIVE_KEYWORDS: &[&str] = &[
    "password", "secret", "token", "key", "auth", "credential",
    "private", "confidential", "sensitive", "restricted",
];

/// Identifiers containing one of these are masked rather than scanned.
const MASKED_IDENTIFIER_KEYWORDS: &[&str] = &["sess", "token", "auth"];

/// Characters kept at each end of a masked identifier.
const IDENTIFIER_VISIBLE_CHARS: usize = 4;
const IDENTIFIER_MASK: &str = "***";

/// Characters that delimit values in the detection patterns.
const TOKEN_FORBIDDEN_CHARS: &[char] = &['"', '\'', ',', ';', '&', '/', '=', ':', '?', '#'];

/// Heuristic redaction of attribute values, free-text messages, identifiers,
/// SQL text and URLs.
///
/// The sensitive key set, the replacement token and the filtering toggles can
/// be changed at runtime while other threads are redacting.
pub struct SecurityFilter {
    patterns: RedactionPatternSet,
    sensitive_keys: DashSet<String>,
    replacement: RwLock<String>,
    pii_detection: AtomicBool,
    token_filtering: AtomicBool,
    url_filtering: AtomicBool,
    sql_sanitization: AtomicBool,
    mask_threshold: usize,
}

impl SecurityFilter {
    /// Compile the pattern set and seed the sensitive key set.
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        let patterns = RedactionPatternSet::new()?;
        validate_replacement(&patterns, &config.replacement_token)?;

        let sensitive_keys = DashSet::new();
        for key in DEFAULT_SENSITIVE_KEYS
            .iter()
            .copied()
            .chain(config.custom_sensitive_keys.iter().map(String::as_str))
        {
            sensitive_keys.insert(key.to_lowercase());
        }

        info!(
            sensitive_keys = sensitive_keys.len(),
            pii_detection = config.pii_detection,
            token_filtering = config.token_filtering,
            url_filtering = config.url_filtering,
            sql_sanitization = config.sql_sanitization,
            "Security filter initialized"
        );

        Ok(Self {
            patterns,
            sensitive_keys,
            replacement: RwLock::new(config.replacement_token.clone()),
            pii_detection: AtomicBool::new(config.pii_detection),
            token_filtering: AtomicBool::new(config.token_filtering),
            url_filtering: AtomicBool::new(config.url_filtering),
            sql_sanitization: AtomicBool::new(config.sql_sanitization),
            mask_threshold: config.identifier_mask_threshold,
        })
    }

    /// Whether `key` names sensitive data.
    pub fn classify(&self, key: &str) -> bool {
        let lower = key.to_lowercase();
        self.sensitive_keys.contains(&lower) || self.patterns.is_sensitive_key(&lower)
    }

    /// Redact one attribute.
    ///
    /// A sensitive key always yields the replacement token. Other values are
    /// scanned for personal data and credentials; values that come out
    /// unchanged keep their original JSON type.
    pub fn redact_attribute(&self, key: &str, value: &Value) -> (String, Value) {
        let token = self.replacement_token();
        if self.classify(key) {
            return (key.to_string(), Value::String(token));
        }
        (key.to_string(), self.redact_value(value, &token))
    }

    fn redact_value(&self, value: &Value, token: &str) -> Value {
        match value {
            Value::Null | Value::Bool(_) => value.clone(),
            Value::String(text) => Value::String(self.scrub(text, token)),
            Value::Number(number) => {
                let text = number.to_string();
                let scrubbed = self.scrub(&text, token);
                if scrubbed == text {
                    value.clone()
                } else {
                    Value::String(scrubbed)
                }
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.redact_value(item, token))
                    .collect(),
            ),
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, field)| {
                        if self.classify(key) {
                            (key.clone(), Value::String(token.to_string()))
                        } else {
                            (key.clone(), self.redact_value(field, token))
                        }
                    })
                    .collect(),
            ),
        }
    }

    /// Personal data and credential redaction applied to attribute values.
    fn scrub(&self, text: &str, token: &str) -> String {
        let mut text = text.to_string();
        if text.is_empty() {
            return text;
        }
        if self.pii_detection.load(Ordering::Relaxed) {
            text = apply_all(self.patterns.pii(), text, token);
        }
        if self.token_filtering.load(Ordering::Relaxed) {
            text = apply_all(self.patterns.tokens(), text, token);
        }
        text
    }

    /// Redact every attribute.
    pub fn sanitize(&self, attributes: &Attributes) -> Attributes {
        attributes
            .iter()
            .map(|(key, value)| self.redact_attribute(key, value))
            .collect()
    }

    /// Redact a free-text message.
    ///
    /// Inline `name=value` credentials are redacted first, then personal
    /// data, tokens and URL parameters. Applying this twice gives the same
    /// result as applying it once.
    pub fn sanitize_message(&self, message: &str) -> String {
        if message.is_empty() {
            return String::new();
        }
        let token = self.replacement_token();

        let mut text = apply_all(self.patterns.inline(), message.to_string(), &token);
        if self.pii_detection.load(Ordering::Relaxed) {
            text = apply_all(self.patterns.pii(), text, &token);
        }
        if self.token_filtering.load(Ordering::Relaxed) {
            text = apply_all(self.patterns.tokens(), text, &token);
        }
        if self.url_filtering.load(Ordering::Relaxed) {
            text = apply_all(self.patterns.urls(), text, &token);
        }
        text
    }

    /// Mask a session, token or auth identifier, keeping its first and last
    /// four characters. Other identifiers only get personal data removed.
    pub fn sanitize_identifier(&self, identifier: &str) -> String {
        if identifier.is_empty() {
            return String::new();
        }

        let lower = identifier.to_lowercase();
        if MASKED_IDENTIFIER_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            return self.mask_identifier(identifier);
        }

        if self.pii_detection.load(Ordering::Relaxed) {
            apply_all(self.patterns.pii(), identifier.to_string(), &self.replacement_token())
        } else {
            identifier.to_string()
        }
    }

    fn mask_identifier(&self, identifier: &str) -> String {
        let chars: Vec<char> = identifier.chars().collect();
        if chars.len() <= self.mask_threshold.max(2 * IDENTIFIER_VISIBLE_CHARS) {
            return self.replacement_token();
        }

        let head: String = chars[..IDENTIFIER_VISIBLE_CHARS].iter().collect();
        let tail: String = chars[chars.len() - IDENTIFIER_VISIBLE_CHARS..].iter().collect();
        format!("{head}{IDENTIFIER_MASK}{tail}")
    }

    /// Redact sensitive literals and comparisons against sensitive columns.
    pub fn sanitize_sql(&self, query: &str) -> String {
        if query.is_empty() || !self.sql_sanitization.load(Ordering::Relaxed) {
            return query.to_string();
        }
        let token = self.replacement_token();

        let literals = self
            .patterns
            .sql_literal()
            .replace_all(query, |caps: &regex::Captures| {
                if self.contains_sensitive(&caps[1]) {
                    format!("'{token}'")
                } else {
                    caps[0].to_string()
                }
            });

        self.patterns
            .sql_condition()
            .replace_all(&literals, |caps: &regex::Captures| {
                if self.classify(&caps["column"]) {
                    format!(
                        "{}{}{}{}'{token}'",
                        &caps["keyword"], &caps["lead"], &caps["column"], &caps["op"]
                    )
                } else {
                    caps[0].to_string()
                }
            })
            .into_owned()
    }

    /// Redact sensitive query and path parameters in a URL.
    pub fn sanitize_url(&self, url: &str) -> String {
        if url.is_empty() || !self.url_filtering.load(Ordering::Relaxed) {
            return url.to_string();
        }
        apply_all(self.patterns.urls(), url.to_string(), &self.replacement_token())
    }

    /// Whether a message may be logged at `severity` at all.
    ///
    /// Debug and info messages carrying sensitive content are refused; warn
    /// and above are always permitted.
    pub fn permits(&self, severity: Severity, message: &str) -> bool {
        severity >= Severity::Warn || !self.contains_sensitive(message)
    }

    fn contains_sensitive(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        if SENSITIVE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            return true;
        }
        if self.pii_detection.load(Ordering::Relaxed)
            && self.patterns.pii().iter().any(|rule| rule.is_match(text))
        {
            return true;
        }
        self.token_filtering.load(Ordering::Relaxed)
            && self.patterns.tokens().iter().any(|rule| rule.is_match(text))
    }

    pub fn add_sensitive_key(&self, key: &str) {
        let key = key.to_lowercase();
        debug!(key = %key, "Sensitive key added");
        self.sensitive_keys.insert(key);
    }

    /// Returns whether the key was present.
    pub fn remove_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        let removed = self.sensitive_keys.remove(&key).is_some();
        debug!(key = %key, removed, "Sensitive key removed");
        removed
    }

    /// Snapshot of the sensitive key set, sorted.
    pub fn sensitive_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sensitive_keys.iter().map(|k| k.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn replacement_token(&self) -> String {
        self.replacement.read().clone()
    }

    /// Change the replacement token.
    ///
    /// The token must be non-empty, free of whitespace and value delimiters,
    /// and must not itself look like sensitive data.
    pub fn set_replacement_token(&self, token: &str) -> Result<()> {
        validate_replacement(&self.patterns, token)?;
        *self.replacement.write() = token.to_string();
        info!(token = %token, "Replacement token updated");
        Ok(())
    }

    pub fn set_pii_detection(&self, enabled: bool) {
        self.pii_detection.store(enabled, Ordering::Relaxed);
    }

    pub fn set_token_filtering(&self, enabled: bool) {
        self.token_filtering.store(enabled, Ordering::Relaxed);
    }

    pub fn set_url_filtering(&self, enabled: bool) {
        self.url_filtering.store(enabled, Ordering::Relaxed);
    }

    pub fn set_sql_sanitization(&self, enabled: bool) {
        self.sql_sanitization.store(enabled, Ordering::Relaxed);
    }
}

fn validate_replacement(patterns: &RedactionPatternSet, token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(TollgateError::Config(
            "replacement token must not be empty".to_string(),
        ));
    }
    if token
        .chars()
        .any(|c| c.is_whitespace() || TOKEN_FORBIDDEN_CHARS.contains(&c))
    {
        return Err(TollgateError::Config(format!(
            "replacement token {token:?} contains whitespace or a value delimiter"
        )));
    }
    if let Some(rule) = patterns.first_match(token) {
        return Err(TollgateError::Config(format!(
            "replacement token {token:?} matches the {rule} pattern"
        )));
    }
    Ok(())
}
