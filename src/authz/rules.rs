use serde_json::Value;
use std::collections::BTreeSet;

use crate::authz::condition::{self, Condition};
use crate::authz::types::{Effect, Principal, Resource};

pub const WILDCARD: &str = "*";

/// Attribute predicate attached to a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleCondition {
    /// Role-only rule.
    Always,
    /// `resource.attr[attribute] == value`
    AttributeEquals { attribute: String, value: Value },
    /// `resource.attr[resource_attribute] == principal.attr[principal_attribute]`;
    /// never matches when the principal lacks the attribute.
    AttributeMatch {
        resource_attribute: String,
        principal_attribute: String,
    },
    /// `resource.attr[attribute] == principal.id`
    Owner { attribute: String },
    Expression(Condition),
    All(Vec<RuleCondition>),
    Any(Vec<RuleCondition>),
    Not(Box<RuleCondition>),
}

impl RuleCondition {
    pub fn owner(attribute: impl Into<String>) -> Self {
        RuleCondition::Owner {
            attribute: attribute.into(),
        }
    }

    pub fn equals(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        RuleCondition::AttributeEquals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn matches_principal(
        resource_attribute: impl Into<String>,
        principal_attribute: impl Into<String>,
    ) -> Self {
        RuleCondition::AttributeMatch {
            resource_attribute: resource_attribute.into(),
            principal_attribute: principal_attribute.into(),
        }
    }

    /// Match against one concrete resource. `context` is the full condition
    /// context used by `Expression` variants.
    pub fn matches(&self, principal: &Principal, resource: &Resource, context: &Value) -> bool {
        match self {
            RuleCondition::Always => true,
            RuleCondition::AttributeEquals { attribute, value } => {
                condition::values_equal(resource_attr(resource, attribute), value)
            }
            RuleCondition::AttributeMatch {
                resource_attribute,
                principal_attribute,
            } => match principal.attributes.get(principal_attribute) {
                None | Some(Value::Null) => false,
                Some(expected) => {
                    condition::values_equal(resource_attr(resource, resource_attribute), expected)
                }
            },
            RuleCondition::Owner { attribute } => {
                match resource_attr(resource, attribute) {
                    Value::String(owner) => *owner == principal.id,
                    _ => false,
                }
            }
            RuleCondition::Expression(cond) => cond.evaluate(context),
            RuleCondition::All(items) => items.iter().all(|c| c.matches(principal, resource, context)),
            RuleCondition::Any(items) => items.iter().any(|c| c.matches(principal, resource, context)),
            RuleCondition::Not(inner) => !inner.matches(principal, resource, context),
        }
    }
}

fn resource_attr<'a>(resource: &'a Resource, attribute: &str) -> &'a Value {
    resource.attributes.get(attribute).unwrap_or(&Value::Null)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: String,
    pub effect: Effect,
    /// Resource kinds, or `*`
    pub resources: Vec<String>,
    /// Actions, or `*`
    pub actions: Vec<String>,
    /// Any one of these roles is required; empty means any principal
    pub roles: Vec<String>,
    pub condition: RuleCondition,
}

impl Rule {
    pub fn allow(id: impl Into<String>) -> Self {
        Self::new(id, Effect::Allow)
    }

    pub fn deny(id: impl Into<String>) -> Self {
        Self::new(id, Effect::Deny)
    }

    fn new(id: impl Into<String>, effect: Effect) -> Self {
        Self {
            id: id.into(),
            effect,
            resources: vec![WILDCARD.to_string()],
            actions: vec![WILDCARD.to_string()],
            roles: Vec::new(),
            condition: RuleCondition::Always,
        }
    }

    pub fn on(mut self, resources: &[&str]) -> Self {
        self.resources = resources.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn actions(mut self, actions: &[&str]) -> Self {
        self.actions = actions.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn when(mut self, condition: RuleCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Kind, action and role scoping; does not look at the condition.
    pub fn applies_to(&self, kind: &str, action: &str, derived_roles: &BTreeSet<String>) -> bool {
        matches_any(&self.resources, kind)
            && matches_any(&self.actions, action)
            && (self.roles.is_empty() || self.roles.iter().any(|r| derived_roles.contains(r)))
    }
}

fn matches_any(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| p == WILDCARD || p == value)
}
