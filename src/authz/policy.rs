use kdl::{KdlDocument, KdlNode, KdlValue};
use serde_json::Value;

use crate::authz::condition::Condition;
use crate::authz::errors::AuthzError;
use crate::authz::hierarchy::HierarchyDefinition;
use crate::authz::rules::{Rule, RuleCondition};
use crate::authz::types::Effect;

/// Contents of one policy document, before cross-file validation.
#[derive(Debug, Default, Clone)]
pub struct ParsedPolicy {
    /// `(tenant id, definition)` in document order
    pub hierarchies: Vec<(String, HierarchyDefinition)>,
    pub rules: Vec<Rule>,
}

/// Parse a KDL document string into hierarchies and rules.
pub fn parse_kdl_document(source: &str) -> Result<ParsedPolicy, AuthzError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| AuthzError::KdlParse(e.to_string()))?;

    let mut policy = ParsedPolicy::default();

    for node in doc.nodes() {
        match node.name().value() {
            "hierarchy" => {
                let tenant = first_string_arg(node).ok_or_else(|| {
                    AuthzError::InvalidPolicy(
                        "hierarchy node requires a tenant argument (e.g. hierarchy \"default\")"
                            .into(),
                    )
                })?;
                policy.hierarchies.push((tenant.clone(), parse_hierarchy(node, &tenant)?));
            }
            "rule" => policy.rules.push(parse_rule(node)?),
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(policy)
}

fn parse_hierarchy(node: &KdlNode, tenant: &str) -> Result<HierarchyDefinition, AuthzError> {
    let mut definition = HierarchyDefinition::new();
    let Some(children) = node.children() else {
        return Ok(definition);
    };
    for child in children.nodes() {
        match child.name().value() {
            "role" => {
                let name = first_string_arg(child).ok_or_else(|| {
                    AuthzError::InvalidPolicy(format!(
                        "role in hierarchy `{tenant}` requires a name (e.g. role \"ADMIN\")"
                    ))
                })?;
                definition.insert(name, dash_list(child));
            }
            other => {
                return Err(AuthzError::InvalidPolicy(format!(
                    "unexpected child `{other}` in hierarchy `{tenant}` (expected `role`)"
                )));
            }
        }
    }
    Ok(definition)
}

fn parse_rule(node: &KdlNode) -> Result<Rule, AuthzError> {
    let id = first_string_arg(node).ok_or_else(|| {
        AuthzError::InvalidPolicy(
            "rule node requires a string argument (e.g. rule \"lead-owner\" effect=\"allow\")"
                .into(),
        )
    })?;

    let effect = match node.get("effect") {
        None => Effect::Allow,
        Some(v) => v.as_string().and_then(Effect::parse).ok_or_else(|| {
            AuthzError::InvalidPolicy(format!(
                "rule `{id}` has invalid effect (expected \"allow\" or \"deny\")"
            ))
        })?,
    };

    let mut rule = match effect {
        Effect::Allow => Rule::allow(id.clone()),
        Effect::Deny => Rule::deny(id.clone()),
    };
    let mut conditions = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "resources" => rule.resources = dash_list(child),
                "actions" => rule.actions = dash_list(child),
                "roles" => rule.roles = dash_list(child),
                _ => conditions.push(parse_condition_node(child, &id)?),
            }
        }
    }

    rule.condition = match conditions.len() {
        0 => RuleCondition::Always,
        1 => conditions.remove(0),
        _ => RuleCondition::All(conditions),
    };
    Ok(rule)
}

fn parse_condition_node(node: &KdlNode, rule: &str) -> Result<RuleCondition, AuthzError> {
    let name = node.name().value();
    match name {
        "owner" => {
            let attribute = first_string_arg(node).unwrap_or_else(|| "ownerId".to_string());
            Ok(RuleCondition::owner(attribute))
        }
        "attribute" => {
            let attribute = first_string_arg(node).ok_or_else(|| {
                AuthzError::InvalidPolicy(format!(
                    "`attribute` in rule `{rule}` requires a name (e.g. attribute \"status\" equals=\"open\")"
                ))
            })?;
            let value = node.get("equals").ok_or_else(|| {
                AuthzError::InvalidPolicy(format!(
                    "`attribute \"{attribute}\"` in rule `{rule}` is missing `equals`"
                ))
            })?;
            Ok(RuleCondition::equals(attribute, kdl_to_json(value)))
        }
        "match" => {
            let prop = |key: &str| {
                node.get(key)
                    .and_then(|v| v.as_string())
                    .map(|s| s.to_string())
                    .ok_or_else(|| {
                        AuthzError::InvalidPolicy(format!(
                            "`match` in rule `{rule}` is missing `{key}` (e.g. match resource=\"tenantId\" principal=\"tenantId\")"
                        ))
                    })
            };
            Ok(RuleCondition::matches_principal(
                prop("resource")?,
                prop("principal")?,
            ))
        }
        "condition" => {
            let source = first_string_arg(node).ok_or_else(|| {
                AuthzError::InvalidPolicy(format!(
                    "`condition` in rule `{rule}` requires an expression string"
                ))
            })?;
            let parsed = Condition::parse(&source).map_err(|e| {
                AuthzError::InvalidCondition(format!("rule `{rule}`: {e}"))
            })?;
            Ok(RuleCondition::Expression(parsed))
        }
        "all" | "any" => {
            let items = nested_conditions(node, rule)?;
            if items.is_empty() {
                return Err(AuthzError::InvalidPolicy(format!(
                    "`{name}` in rule `{rule}` has no conditions"
                )));
            }
            Ok(if name == "all" {
                RuleCondition::All(items)
            } else {
                RuleCondition::Any(items)
            })
        }
        "not" => {
            let mut items = nested_conditions(node, rule)?;
            if items.len() != 1 {
                return Err(AuthzError::InvalidPolicy(format!(
                    "`not` in rule `{rule}` must wrap exactly one condition"
                )));
            }
            Ok(RuleCondition::Not(Box::new(items.remove(0))))
        }
        other => Err(AuthzError::InvalidPolicy(format!(
            "unexpected child `{other}` in rule `{rule}`"
        ))),
    }
}

fn nested_conditions(node: &KdlNode, rule: &str) -> Result<Vec<RuleCondition>, AuthzError> {
    let Some(children) = node.children() else {
        return Ok(Vec::new());
    };
    children
        .nodes()
        .iter()
        .map(|child| parse_condition_node(child, rule))
        .collect()
}

fn kdl_to_json(value: &KdlValue) -> Value {
    if let Some(s) = value.as_string() {
        return Value::String(s.to_string());
    }
    if let Some(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Some(i) = value.as_integer() {
        return i64::try_from(i)
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(i as f64));
    }
    if let Some(f) = value.as_float() {
        return Value::from(f);
    }
    Value::Null
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// Extract dash-list children: nodes named "-" whose first argument is a string.
/// Example KDL:
/// ```kdl
/// actions {
///     - "read"
///     - "update"
/// }
/// ```
fn dash_list(node: &KdlNode) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter(|n| n.name().value() == "-")
        .filter_map(first_string_arg)
        .collect()
}
