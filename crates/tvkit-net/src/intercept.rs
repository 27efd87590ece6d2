//! Request interception rules.
//!
//! Decides per request whether a caching layer may handle it or must pass
//! it straight to the network.

use crate::{Request, Url};
use http::Method;
use tracing::trace;

/// Action to take for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptAction {
    /// The caching layer handles the request.
    Handle,
    /// Go straight to the network. No cache read, no cache write.
    Bypass,
}

/// Substring of a URL path. Query and host are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    marker: String,
}

impl UrlPattern {
    /// Match URLs whose path contains `marker`.
    pub fn path_contains(marker: &str) -> Self {
        Self {
            marker: marker.to_string(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        url.path().contains(&self.marker)
    }
}

/// What a rule looks at.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    /// The request URL matches a pattern.
    Url(UrlPattern),
    /// The request method is anything other than the given one.
    MethodOtherThan(Method),
}

impl RuleMatcher {
    fn matches(&self, request: &Request) -> bool {
        match self {
            RuleMatcher::Url(pattern) => pattern.matches(&request.url),
            RuleMatcher::MethodOtherThan(method) => request.method != *method,
        }
    }

    fn describe(&self) -> String {
        match self {
            RuleMatcher::Url(pattern) => format!("path contains {}", pattern.marker()),
            RuleMatcher::MethodOtherThan(method) => format!("method != {method}"),
        }
    }
}

/// Rule for intercepting requests.
#[derive(Debug, Clone)]
pub struct InterceptRule {
    /// What to match.
    pub matcher: RuleMatcher,
    /// Action to take.
    pub action: InterceptAction,
    /// Priority (higher = first).
    pub priority: i32,
}

/// Request interceptor with configurable rules. Requests no rule matches
/// are handled.
#[derive(Debug, Clone, Default)]
pub struct RequestInterceptor {
    rules: Vec<InterceptRule>,
}

impl RequestInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule.
    pub fn add_rule(&mut self, rule: InterceptRule) {
        self.rules.push(rule);
        // Stable sort keeps insertion order within a priority
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Bypass URLs matching a pattern.
    pub fn bypass(&mut self, pattern: UrlPattern) {
        self.add_rule(InterceptRule {
            matcher: RuleMatcher::Url(pattern),
            action: InterceptAction::Bypass,
            priority: 0,
        });
    }

    /// Bypass every request whose method is not `method`.
    pub fn only_method(&mut self, method: Method) {
        self.add_rule(InterceptRule {
            matcher: RuleMatcher::MethodOtherThan(method),
            action: InterceptAction::Bypass,
            priority: 20,
        });
    }

    /// Number of configured rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Intercept a request.
    pub fn intercept(&self, request: &Request) -> InterceptAction {
        for rule in &self.rules {
            if rule.matcher.matches(request) {
                trace!(
                    url = %request.url,
                    rule = %rule.matcher.describe(),
                    action = ?rule.action,
                    "Rule matched"
                );
                return rule.action;
            }
        }

        InterceptAction::Handle
    }
}
