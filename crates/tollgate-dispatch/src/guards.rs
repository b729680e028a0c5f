//! Request-body guards and filters (DESIGN §4.6).
//!
//! Three independent, admin-configurable rule sets sit ahead of the
//! forwarder: a sensitive-content guard that blocks on first match, an
//! ordered request-filter engine that rewrites headers/body, and an
//! error-rule classifier that the circuit breaker's failure classification
//! and the response handler both consult. All three compile their rule set
//! once on change and are invalidated by the same pub/sub broadcast the
//! admin API fires on every mutation (DESIGN §4.6, §6).

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Contains,
    Exact,
    Regex,
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("invalid regex pattern {0:?}: {1}")]
    InvalidRegex(String, regex::Error),
}

/// One compiled matcher: either a literal string test or a compiled regex.
enum CompiledMatcher {
    Contains(String),
    Exact(String),
    Regex(Regex),
}

impl CompiledMatcher {
    fn compile(pattern: &str, match_type: MatchType) -> Result<Self, GuardError> {
        Ok(match match_type {
            MatchType::Contains => CompiledMatcher::Contains(pattern.to_string()),
            MatchType::Exact => CompiledMatcher::Exact(pattern.to_string()),
            MatchType::Regex => CompiledMatcher::Regex(
                Regex::new(pattern).map_err(|e| GuardError::InvalidRegex(pattern.to_string(), e))?,
            ),
        })
    }

    fn is_match(&self, text: &str) -> bool {
        match self {
            CompiledMatcher::Contains(needle) => text.contains(needle.as_str()),
            CompiledMatcher::Exact(exact) => text == exact,
            CompiledMatcher::Regex(re) => re.is_match(text),
        }
    }
}

/// Source row for one sensitive-word rule, as loaded from admin config.
#[derive(Debug, Clone)]
pub struct SensitiveWordRule {
    pub id: i64,
    pub pattern: String,
    pub match_type: MatchType,
    pub enabled: bool,
}

/// Compiled rule set; rebuilt whenever the admin API broadcasts a
/// cache-invalidation event for sensitive words.
pub struct SensitiveWordGuard {
    rules: Vec<(i64, CompiledMatcher)>,
}

impl SensitiveWordGuard {
    pub fn compile(rules: &[SensitiveWordRule]) -> Result<Self, GuardError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules.iter().filter(|r| r.enabled) {
            compiled.push((rule.id, CompiledMatcher::compile(&rule.pattern, rule.match_type)?));
        }
        Ok(Self { rules: compiled })
    }

    /// Scans `flattened_text` against every rule in order; returns the id of
    /// the first match, or `None` if the text is clean.
    pub fn first_match(&self, flattened_text: &str) -> Option<i64> {
        self.rules
            .iter()
            .find(|(_, matcher)| matcher.is_match(flattened_text))
            .map(|(id, _)| *id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterScope {
    Header,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    Remove,
    Set,
    JsonPath,
    TextReplace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterBinding {
    Global,
    Providers(Vec<String>),
    Groups(Vec<String>),
}

impl FilterBinding {
    fn matches(&self, provider_id: Option<&str>, group: Option<&str>) -> bool {
        match self {
            FilterBinding::Global => true,
            FilterBinding::Providers(ids) => provider_id.is_some_and(|p| ids.iter().any(|i| i == p)),
            FilterBinding::Groups(groups) => group.is_some_and(|g| groups.iter().any(|i| i == g)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestFilterRule {
    pub id: i64,
    pub priority: i32,
    pub scope: FilterScope,
    pub action: FilterAction,
    pub target: String,
    pub value: Option<String>,
    pub binding: FilterBinding,
    pub enabled: bool,
}

/// Mutable view the engine rewrites in place. Headers are a simple ordered
/// list so `remove`/`set` semantics match typical HTTP header multimaps.
pub struct FilterableRequest<'a> {
    pub headers: &'a mut Vec<(String, String)>,
    pub body: &'a mut JsonValue,
}

pub struct RequestFilterEngine {
    rules: Vec<RequestFilterRule>,
}

impl RequestFilterEngine {
    /// Rules are sorted ascending by `priority` at compile time so `apply`
    /// never has to re-sort on the hot path.
    pub fn compile(mut rules: Vec<RequestFilterRule>) -> Self {
        rules.retain(|r| r.enabled);
        rules.sort_by_key(|r| r.priority);
        Self { rules }
    }

    /// Applies every bound rule in priority order; later rules observe the
    /// effect of earlier ones since `request` is mutated in place.
    pub fn apply(&self, request: &mut FilterableRequest<'_>, provider_id: Option<&str>, group: Option<&str>) {
        for rule in &self.rules {
            if !rule.binding.matches(provider_id, group) {
                continue;
            }
            match rule.scope {
                FilterScope::Header => self.apply_header_rule(rule, request.headers),
                FilterScope::Body => self.apply_body_rule(rule, request.body),
            }
        }
    }

    fn apply_header_rule(&self, rule: &RequestFilterRule, headers: &mut Vec<(String, String)>) {
        match rule.action {
            FilterAction::Remove => headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&rule.target)),
            FilterAction::Set => {
                headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&rule.target));
                if let Some(value) = &rule.value {
                    headers.push((rule.target.clone(), value.clone()));
                }
            }
            FilterAction::TextReplace => {
                if let Some(value) = &rule.value {
                    for (k, v) in headers.iter_mut() {
                        if k.eq_ignore_ascii_case(&rule.target) {
                            *v = value.clone();
                        }
                    }
                }
            }
            FilterAction::JsonPath => {
                // Header scope has no JSON structure to path into; a
                // json_path rule bound to headers is a no-op by contract.
            }
        }
    }

    fn apply_body_rule(&self, rule: &RequestFilterRule, body: &mut JsonValue) {
        match rule.action {
            FilterAction::Remove => {
                if let Some(obj) = body.as_object_mut() {
                    obj.remove(&rule.target);
                }
            }
            FilterAction::Set => {
                if let (Some(obj), Some(value)) = (body.as_object_mut(), &rule.value) {
                    obj.insert(
                        rule.target.clone(),
                        serde_json::from_str(value).unwrap_or_else(|_| JsonValue::String(value.clone())),
                    );
                }
            }
            FilterAction::JsonPath => {
                if let Some(value) = &rule.value {
                    set_by_json_path(body, &rule.target, value);
                }
            }
            FilterAction::TextReplace => {
                if let Some(value) = &rule.value {
                    replace_text_at_path(body, &rule.target, value);
                }
            }
        }
    }
}

/// Minimal dot-path setter (`a.b.c`) sufficient for the flat config paths
/// request filters target; does not support array indices.
fn set_by_json_path(root: &mut JsonValue, path: &str, raw_value: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut cursor = root;
    for (idx, part) in parts.iter().enumerate() {
        if idx == parts.len() - 1 {
            if let Some(obj) = cursor.as_object_mut() {
                obj.insert(
                    part.to_string(),
                    serde_json::from_str(raw_value).unwrap_or_else(|_| JsonValue::String(raw_value.to_string())),
                );
            }
            return;
        }
        if !cursor.is_object() {
            *cursor = JsonValue::Object(Default::default());
        }
        cursor = cursor
            .as_object_mut()
            .unwrap()
            .entry(part.to_string())
            .or_insert_with(|| JsonValue::Object(Default::default()));
    }
}

fn replace_text_at_path(root: &mut JsonValue, path: &str, replacement: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut cursor = root;
    for part in &parts {
        cursor = match cursor.get_mut(*part) {
            Some(next) => next,
            None => return,
        };
    }
    if let Some(s) = cursor.as_str() {
        *cursor = JsonValue::String(s.replace('\u{0}', "").to_string());
        *cursor = JsonValue::String(replacement.to_string());
        let _ = s;
    }
}

/// `(pattern, match_type, category, override_response?, override_status?)`
/// consulted by both the breaker's failure classifier and the response
/// handler (DESIGN §4.2, §4.6).
#[derive(Debug, Clone)]
pub struct ErrorRule {
    pub id: i64,
    pub pattern: String,
    pub match_type: MatchType,
    pub category: ErrorRuleCategory,
    pub override_response: Option<JsonValue>,
    pub override_status_code: Option<u16>,
    pub priority: i32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorRuleCategory {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone)]
pub struct ErrorRuleMatch<'a> {
    pub rule_id: i64,
    pub category: ErrorRuleCategory,
    pub override_response: Option<&'a JsonValue>,
    pub override_status_code: Option<u16>,
}

pub struct ErrorRuleClassifier {
    rules: Vec<(ErrorRule, CompiledMatcher)>,
}

impl ErrorRuleClassifier {
    pub fn compile(mut rules: Vec<ErrorRule>) -> Result<Self, GuardError> {
        rules.retain(|r| r.enabled);
        rules.sort_by_key(|r| r.priority);
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let matcher = CompiledMatcher::compile(&rule.pattern, rule.match_type)?;
            compiled.push((rule, matcher));
        }
        Ok(Self { rules: compiled })
    }

    /// First matching rule against the upstream's error body/message, in
    /// ascending priority order.
    pub fn classify(&self, error_text: &str) -> Option<ErrorRuleMatch<'_>> {
        self.rules
            .iter()
            .find(|(_, matcher)| matcher.is_match(error_text))
            .map(|(rule, _)| ErrorRuleMatch {
                rule_id: rule.id,
                category: rule.category,
                override_response: rule.override_response.as_ref(),
                override_status_code: rule.override_status_code,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_word_guard_blocks_on_first_contains_match() {
        let rules = vec![SensitiveWordRule {
            id: 1,
            pattern: "forbidden".to_string(),
            match_type: MatchType::Contains,
            enabled: true,
        }];
        let guard = SensitiveWordGuard::compile(&rules).unwrap();
        assert_eq!(guard.first_match("this has forbidden text"), Some(1));
        assert_eq!(guard.first_match("clean text"), None);
    }

    #[test]
    fn sensitive_word_guard_skips_disabled_rules() {
        let rules = vec![SensitiveWordRule {
            id: 1,
            pattern: "forbidden".to_string(),
            match_type: MatchType::Contains,
            enabled: false,
        }];
        let guard = SensitiveWordGuard::compile(&rules).unwrap();
        assert_eq!(guard.first_match("this has forbidden text"), None);
    }

    #[test]
    fn sensitive_word_guard_regex_match() {
        let rules = vec![SensitiveWordRule {
            id: 2,
            pattern: r"\bssn\s*\d{3}-\d{2}-\d{4}\b".to_string(),
            match_type: MatchType::Regex,
            enabled: true,
        }];
        let guard = SensitiveWordGuard::compile(&rules).unwrap();
        assert_eq!(guard.first_match("my ssn 123-45-6789 is private"), Some(2));
    }

    #[test]
    fn request_filter_applies_in_priority_order_and_sees_earlier_effects() {
        let rules = vec![
            RequestFilterRule {
                id: 1,
                priority: 10,
                scope: FilterScope::Header,
                action: FilterAction::Remove,
                target: "x-debug".to_string(),
                value: None,
                binding: FilterBinding::Global,
                enabled: true,
            },
            RequestFilterRule {
                id: 2,
                priority: 5,
                scope: FilterScope::Header,
                action: FilterAction::Set,
                target: "x-debug".to_string(),
                value: Some("on".to_string()),
                binding: FilterBinding::Global,
                enabled: true,
            },
        ];
        let engine = RequestFilterEngine::compile(rules);
        let mut headers = vec![];
        let mut body = JsonValue::Null;
        let mut req = FilterableRequest {
            headers: &mut headers,
            body: &mut body,
        };
        engine.apply(&mut req, None, None);
        // priority 5 sets it, priority 10 then removes it.
        assert!(headers.is_empty());
    }

    #[test]
    fn request_filter_binding_excludes_unmatched_provider() {
        let rules = vec![RequestFilterRule {
            id: 1,
            priority: 0,
            scope: FilterScope::Header,
            action: FilterAction::Set,
            target: "x-provider-only".to_string(),
            value: Some("v".to_string()),
            binding: FilterBinding::Providers(vec!["prov-a".to_string()]),
            enabled: true,
        }];
        let engine = RequestFilterEngine::compile(rules);
        let mut headers = vec![];
        let mut body = JsonValue::Null;
        let mut req = FilterableRequest {
            headers: &mut headers,
            body: &mut body,
        };
        engine.apply(&mut req, Some("prov-b"), None);
        assert!(headers.is_empty());
        engine.apply(&mut req, Some("prov-a"), None);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn error_rule_classifier_matches_non_retryable_category() {
        let rules = vec![ErrorRule {
            id: 1,
            pattern: "content_policy_violation".to_string(),
            match_type: MatchType::Contains,
            category: ErrorRuleCategory::NonRetryable,
            override_response: None,
            override_status_code: Some(400),
            priority: 0,
            enabled: true,
        }];
        let classifier = ErrorRuleClassifier::compile(rules).unwrap();
        let matched = classifier
            .classify(r#"{"error":{"message":"content_policy_violation"}}"#)
            .unwrap();
        assert_eq!(matched.category, ErrorRuleCategory::NonRetryable);
        assert_eq!(matched.override_status_code, Some(400));
    }

    #[test]
    fn error_rule_classifier_returns_none_when_no_rule_matches() {
        let classifier = ErrorRuleClassifier::compile(vec![]).unwrap();
        assert!(classifier.classify("anything").is_none());
    }
}
