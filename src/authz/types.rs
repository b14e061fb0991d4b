use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::authz::errors::AuthzError;

/// Open key-value bag attached to principals and resources.
/// Values are read through typed getters so predicates state what they expect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, Value>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Result<&str, AuthzError> {
        match self.0.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(wrong_type(key, "string", other)),
            None => Err(missing(key)),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, AuthzError> {
        match self.0.get(key) {
            Some(v) => v.as_i64().ok_or_else(|| wrong_type(key, "integer", v)),
            None => Err(missing(key)),
        }
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, AuthzError> {
        match self.0.get(key) {
            Some(v) => v.as_f64().ok_or_else(|| wrong_type(key, "number", v)),
            None => Err(missing(key)),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, AuthzError> {
        match self.0.get(key) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(wrong_type(key, "boolean", other)),
            None => Err(missing(key)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON object view used as the `attr` node of the condition context.
    pub fn to_json(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Map<_, _>>())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn missing(key: &str) -> AuthzError {
    AuthzError::InvalidInput(format!("attribute `{key}` is missing"))
}

fn wrong_type(key: &str, expected: &str, got: &Value) -> AuthzError {
    AuthzError::InvalidInput(format!("attribute `{key}` must be a {expected}, got {got}"))
}

/// Who is asking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key, value);
        self
    }
}

/// What is being acted on. `id` is absent for class-level questions
/// ("can this principal create any lead").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Resource {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key, value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "ALLOW",
            Effect::Deny => "DENY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Some(Effect::Allow),
            "deny" => Some(Effect::Deny),
            _ => None,
        }
    }
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one `evaluate` call. `allowed()` is derived from `effect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub effect: Effect,
    pub reason: String,
    pub matched_rules: Vec<String>,
    pub derived_roles: BTreeSet<String>,
    pub correlation_id: String,
    pub latency_ms: f64,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        self.effect == Effect::Allow
    }
}

/// Builds the `{ principal, resource, request }` object conditions are evaluated against.
pub fn condition_context(
    principal: &Principal,
    derived_roles: &BTreeSet<String>,
    resource_kind: &str,
    resource: Option<&Resource>,
    request: &Value,
) -> Value {
    let resource_node = match resource {
        Some(r) => json!({
            "kind": r.kind,
            "id": r.id,
            "attr": r.attributes.to_json(),
        }),
        None => json!({ "kind": resource_kind }),
    };
    json!({
        "principal": {
            "id": principal.id,
            "roles": derived_roles.iter().collect::<Vec<_>>(),
            "attr": principal.attributes.to_json(),
        },
        "resource": resource_node,
        "request": request,
    })
}

pub(crate) fn validate_input(
    principal: &Principal,
    resource_kind: &str,
    action: &str,
) -> Result<(), AuthzError> {
    if principal.id.trim().is_empty() {
        return Err(AuthzError::InvalidInput("principal id is empty".into()));
    }
    if resource_kind.trim().is_empty() {
        return Err(AuthzError::InvalidInput("resource kind is empty".into()));
    }
    if action.trim().is_empty() {
        return Err(AuthzError::InvalidInput("action is empty".into()));
    }
    Ok(())
}

// ---------- API request/response types ----------

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckRequest {
    pub principal: Principal,
    pub resource: Resource,
    pub action: String,
    /// Optional runtime data exposed to conditions as `request.*`
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub allowed: bool,
    #[serde(flatten)]
    pub decision: Decision,
}

impl From<Decision> for CheckResponse {
    fn from(decision: Decision) -> Self {
        Self {
            allowed: decision.allowed(),
            decision,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchCheckRequest {
    pub principal: Principal,
    pub resource: Resource,
    pub actions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchCheckResponse {
    pub results: BTreeMap<String, bool>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub principal: Principal,
    pub resource_kind: String,
    pub action: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlanResponse {
    pub filter: Value,
    pub orm: Value,
    pub sql: String,
    pub params: Vec<Value>,
}
