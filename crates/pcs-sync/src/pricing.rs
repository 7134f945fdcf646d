//! Conditional pricing rules and the rule book they live in.
//!
//! Rules never touch the catalog on their own; they are evaluated only when
//! explicitly applied.

use chrono::{DateTime, Utc};
use pcs_core::{MarginSource, PricingRule, ProviderService, RuleConditions};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::SyncError;

fn default_true() -> bool {
    true
}

/// Editable part of a rule. `id` is generated when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub margin_percent: f64,
    #[serde(default)]
    pub fixed_markup: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub priority: i32,
}

impl RuleDraft {
    pub fn new(name: impl Into<String>, margin_percent: f64) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            conditions: RuleConditions::default(),
            margin_percent,
            fixed_markup: 0.0,
            is_active: true,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_conditions(mut self, conditions: RuleConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn into_rule(self, now: DateTime<Utc>) -> PricingRule {
        PricingRule {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            description: self.description,
            conditions: self.conditions,
            margin_percent: self.margin_percent,
            fixed_markup: self.fixed_markup,
            is_active: self.is_active,
            priority: self.priority,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn conditions_match(conditions: &RuleConditions, service: &ProviderService) -> bool {
    conditions.platform.map_or(true, |p| service.platform == p)
        && conditions
            .service_type
            .map_or(true, |t| service.service_type == t)
        && conditions
            .quality_tier
            .map_or(true, |q| service.quality_tier == q)
        && conditions
            .min_quantity
            .map_or(true, |min| service.min_quantity >= min)
        && conditions
            .max_quantity
            .map_or(true, |max| service.max_quantity <= max)
}

/// Highest-priority active rule matching `service`. On equal priority the rule
/// that comes first in `rules` wins.
pub fn select_rule<'a>(rules: &'a [PricingRule], service: &ProviderService) -> Option<&'a PricingRule> {
    rules
        .iter()
        .filter(|rule| rule.is_active && conditions_match(&rule.conditions, service))
        .fold(None, |best: Option<&PricingRule>, rule| match best {
            Some(current) if rule.priority <= current.priority => Some(current),
            _ => Some(rule),
        })
}

/// Margin the rule yields for `base_rate`. A positive fixed markup is folded in
/// as the equivalent percentage of the base rate.
pub fn effective_margin(rule: &PricingRule, base_rate: f64) -> f64 {
    if rule.fixed_markup > 0.0 && base_rate > 0.0 {
        rule.margin_percent + rule.fixed_markup / base_rate * 100.0
    } else {
        rule.margin_percent
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRulesReport {
    pub evaluated: usize,
    pub repriced: usize,
    pub unmatched: usize,
}

/// Reprice every service matched by a rule; unmatched services keep their margin.
pub fn apply_rules(
    services: &mut [ProviderService],
    rules: &[PricingRule],
    now: DateTime<Utc>,
) -> ApplyRulesReport {
    let mut report = ApplyRulesReport::default();
    for service in services.iter_mut() {
        report.evaluated += 1;
        match select_rule(rules, service) {
            Some(rule) => {
                let margin = effective_margin(rule, service.base_rate);
                service.set_margin(margin, MarginSource::Rule);
                service.updated_at = now;
                report.repriced += 1;
            }
            None => report.unmatched += 1,
        }
    }
    report
}

/// Ordered rule collection. Registration order is the tie-breaker.
#[derive(Debug, Default)]
pub struct RuleBook {
    rules: RwLock<Vec<PricingRule>>,
}

impl RuleBook {
    pub fn new(rules: Vec<PricingRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub async fn list(&self) -> Vec<PricingRule> {
        self.rules.read().await.clone()
    }

    pub async fn replace_all(&self, rules: Vec<PricingRule>) {
        *self.rules.write().await = rules;
    }

    pub async fn add(&self, draft: RuleDraft, now: DateTime<Utc>) -> Result<PricingRule, SyncError> {
        let rule = draft.into_rule(now);
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(SyncError::DuplicateRule(rule.id));
        }
        rules.push(rule.clone());
        Ok(rule)
    }

    /// Replace a rule's editable fields, keeping its id, position and creation time.
    pub async fn update(
        &self,
        id: &str,
        draft: RuleDraft,
        now: DateTime<Utc>,
    ) -> Result<PricingRule, SyncError> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| SyncError::RuleNotFound(id.to_string()))?;
        let created_at = rule.created_at;
        *rule = RuleDraft {
            id: Some(id.to_string()),
            ..draft
        }
        .into_rule(now);
        rule.created_at = created_at;
        Ok(rule.clone())
    }

    pub async fn remove(&self, id: &str) -> Result<PricingRule, SyncError> {
        let mut rules = self.rules.write().await;
        let index = rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| SyncError::RuleNotFound(id.to_string()))?;
        Ok(rules.remove(index))
    }
}
