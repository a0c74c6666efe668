//! Admission rules and the policy document they are loaded from.
//!
//! A policy document lists rules in priority order. Each rule optionally
//! restricts itself to a route pattern and a set of HTTP methods, and carries
//! a soft limit (above which requests are paced) and a hard limit (above
//! which requests are rejected). Limits in the document are cluster-wide;
//! they are divided by `node_count` at load time so each node enforces its
//! share.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use crate::error::{GovernorError, Result};

/// Sleep granularity used when the document does not set one, in seconds.
const DEFAULT_SLEEP_THRESHOLD: f64 = 0.1;

/// The declarative policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    /// Window length in seconds
    #[serde(alias = "period_sec")]
    pub period_seconds: u64,

    /// Number of nodes sharing the traffic
    #[serde(default = "default_node_count")]
    pub node_count: u64,

    /// Minimum delay worth inducing, in seconds
    #[serde(default = "default_sleep_threshold")]
    pub sleep_threshold: f64,

    /// Rules in match order
    #[serde(alias = "rates")]
    pub rules: Vec<RuleDocument>,
}

fn default_node_count() -> u64 {
    1
}

fn default_sleep_threshold() -> f64 {
    DEFAULT_SLEEP_THRESHOLD
}

/// A single rule as written in the policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDocument {
    /// Rule name, used in logs and rejections
    pub name: String,
    /// Route pattern; must match the whole path
    #[serde(default)]
    pub route: Option<String>,
    /// HTTP methods this rule applies to, compared case-sensitively
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    /// Cluster-wide soft limit per window
    pub soft_limit: u64,
    /// Cluster-wide hard limit per window
    pub hard_limit: u64,
}

impl PolicyDocument {
    /// Load a policy document from a file.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML; everything
    /// else is parsed as JSON.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy document");

        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => Self::from_json(&contents),
        }
    }

    /// Parse a policy document from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a policy document from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// The window length.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.period_seconds == 0 {
            return Err(GovernorError::Config(
                "period_seconds must be greater than zero".to_string(),
            ));
        }
        if self.node_count == 0 {
            return Err(GovernorError::Config(
                "node_count must be greater than zero".to_string(),
            ));
        }
        if !self.sleep_threshold.is_finite() || self.sleep_threshold < 0.0 {
            return Err(GovernorError::Config(format!(
                "sleep_threshold must be a non-negative number of seconds, got {}",
                self.sleep_threshold
            )));
        }
        if self.rules.is_empty() {
            return Err(GovernorError::Config(
                "policy document must define at least one rule".to_string(),
            ));
        }
        Ok(())
    }
}

/// A compiled, immutable admission rule.
#[derive(Debug, Clone)]
pub struct Rule {
    name: String,
    route: Option<Regex>,
    methods: Option<HashSet<String>>,
    soft_limit: u64,
    hard_limit: u64,
    period: Duration,
    target: f64,
}

impl Rule {
    /// Compile a rule from its document form.
    ///
    /// `period` and `node_count` come from the enclosing policy document.
    pub fn compile(doc: &RuleDocument, period: Duration, node_count: u64) -> Result<Self> {
        if doc.name.trim().is_empty() {
            return Err(GovernorError::InvalidRule {
                rule: doc.name.clone(),
                reason: "name must not be empty".to_string(),
            });
        }
        if period.is_zero() {
            return Err(GovernorError::InvalidRule {
                rule: doc.name.clone(),
                reason: "period must be greater than zero".to_string(),
            });
        }
        if node_count == 0 {
            return Err(GovernorError::InvalidRule {
                rule: doc.name.clone(),
                reason: "node_count must be greater than zero".to_string(),
            });
        }
        if doc.hard_limit < doc.soft_limit {
            return Err(GovernorError::InvalidRule {
                rule: doc.name.clone(),
                reason: format!(
                    "hard_limit ({}) is lower than soft_limit ({})",
                    doc.hard_limit, doc.soft_limit
                ),
            });
        }

        let route = match &doc.route {
            Some(pattern) => Some(
                Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| {
                    GovernorError::InvalidRoute {
                        rule: doc.name.clone(),
                        source,
                    }
                })?,
            ),
            None => None,
        };

        let methods = match &doc.methods {
            Some(methods) if methods.is_empty() => {
                return Err(GovernorError::InvalidRule {
                    rule: doc.name.clone(),
                    reason: "methods must list at least one method when present".to_string(),
                });
            }
            Some(methods) => Some(methods.iter().cloned().collect()),
            None => None,
        };

        let soft_limit = doc.soft_limit / node_count;
        let hard_limit = doc.hard_limit / node_count;

        Ok(Self {
            name: doc.name.clone(),
            route,
            methods,
            soft_limit,
            hard_limit,
            period,
            target: soft_limit as f64 / period.as_secs_f64(),
        })
    }

    /// Whether this rule applies to the given request.
    pub fn applies_to(&self, method: &str, path: &str) -> bool {
        if let Some(route) = &self.route {
            if !route.is_match(path) {
                return false;
            }
        }

        match &self.methods {
            Some(methods) => methods.contains(method),
            None => true,
        }
    }

    /// The rule name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-node soft limit per window.
    pub fn soft_limit(&self) -> u64 {
        self.soft_limit
    }

    /// Per-node hard limit per window.
    pub fn hard_limit(&self) -> u64 {
        self.hard_limit
    }

    /// Window length.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sustained requests per second this rule paces toward.
    pub fn target(&self) -> f64 {
        self.target
    }
}

/// Ordered list of rules; the first applicable rule wins.
#[derive(Debug, Clone, Default)]
pub struct RuleCatalog {
    rules: Vec<Arc<Rule>>,
}

impl RuleCatalog {
    /// Create an empty catalog. It matches nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every rule of a policy document, failing on the first
    /// invalid one.
    pub fn from_document(doc: &PolicyDocument) -> Result<Self> {
        doc.validate()?;

        let period = doc.period();
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(doc.rules.len());

        for rule_doc in &doc.rules {
            if !seen.insert(rule_doc.name.as_str()) {
                return Err(GovernorError::InvalidRule {
                    rule: rule_doc.name.clone(),
                    reason: "duplicate rule name".to_string(),
                });
            }

            let rule = Rule::compile(rule_doc, period, doc.node_count)?;
            debug!(
                rule = %rule.name(),
                soft_limit = rule.soft_limit(),
                hard_limit = rule.hard_limit(),
                target = rule.target(),
                "Compiled rule"
            );
            rules.push(Arc::new(rule));
        }

        info!(
            rules = rules.len(),
            period_seconds = doc.period_seconds,
            node_count = doc.node_count,
            "Rule catalog loaded"
        );

        Ok(Self { rules })
    }

    /// Find the first rule that applies to the request.
    pub fn find(&self, method: &str, path: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|rule| rule.applies_to(method, path))
    }

    /// All rules in match order.
    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the catalog has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
