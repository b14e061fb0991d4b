//! Query planning: turn "which `kind` rows may this principal `action`?"
//! into a structural [`Filter`] instead of evaluating row by row.
//!
//! The principal is known at planning time, so every `principal.*` reference
//! is folded into a constant and only resource attributes remain as fields.
//! A filter built here matches a resource exactly when
//! [`PolicyEngine::evaluate`] would allow it. Rules whose conditions cannot be
//! expressed that way are reported ([`PlannerMode::Strict`]) or narrowed
//! ([`PlannerMode::Narrow`]); the visible set is never widened.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::authz::condition::{self, BinOp, Expr};
use crate::authz::engine::PolicyEngine;
use crate::authz::errors::AuthzError;
use crate::authz::rules::RuleCondition;
use crate::authz::types::{condition_context, validate_input, Effect, Principal, Resource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    /// The instance id column.
    Id,
    Attribute(String),
}

impl Field {
    pub fn name(&self) -> &str {
        match self {
            Field::Id => "id",
            Field::Attribute(name) => name,
        }
    }

    fn value_of(&self, resource: &Resource) -> Value {
        match self {
            Field::Id => resource.id.clone().map(Value::String).unwrap_or(Value::Null),
            Field::Attribute(name) => resource.attributes.get(name).cloned().unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Gt,
    Lt,
    Ge,
    Le,
}

impl CompareOp {
    fn from_bin_op(op: BinOp) -> Option<Self> {
        match op {
            BinOp::Gt => Some(CompareOp::Gt),
            BinOp::Lt => Some(CompareOp::Lt),
            BinOp::Ge => Some(CompareOp::Ge),
            BinOp::Le => Some(CompareOp::Le),
            _ => None,
        }
    }

    fn as_bin_op(self) -> BinOp {
        match self {
            CompareOp::Gt => BinOp::Gt,
            CompareOp::Lt => BinOp::Lt,
            CompareOp::Ge => BinOp::Ge,
            CompareOp::Le => BinOp::Le,
        }
    }

    fn sql(self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
        }
    }

    fn orm(self) -> &'static str {
        match self {
            CompareOp::Gt => "gt",
            CompareOp::Lt => "lt",
            CompareOp::Ge => "gte",
            CompareOp::Le => "lte",
        }
    }
}

/// Expression tree over resource fields. Every node is two-valued: a missing
/// attribute reads as null and comparisons against it are false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Filter {
    True,
    False,
    Eq { field: Field, value: Value },
    Ne { field: Field, value: Value },
    Compare { field: Field, cmp: CompareOp, value: Value },
    In { field: Field, values: Vec<Value> },
    And { filters: Vec<Filter> },
    Or { filters: Vec<Filter> },
    Not { filter: Box<Filter> },
}

impl Filter {
    fn constant(b: bool) -> Self {
        if b {
            Filter::True
        } else {
            Filter::False
        }
    }

    pub fn and(items: Vec<Filter>) -> Self {
        let mut out = Vec::new();
        for item in items {
            match item {
                Filter::True => {}
                Filter::False => return Filter::False,
                Filter::And { filters } => out.extend(filters),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Filter::True,
            1 => out.remove(0),
            _ => Filter::And { filters: out },
        }
    }

    pub fn or(items: Vec<Filter>) -> Self {
        let mut out = Vec::new();
        for item in items {
            match item {
                Filter::False => {}
                Filter::True => return Filter::True,
                Filter::Or { filters } => out.extend(filters),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Filter::False,
            1 => out.remove(0),
            _ => Filter::Or { filters: out },
        }
    }

    pub fn negate(inner: Filter) -> Self {
        match inner {
            Filter::True => Filter::False,
            Filter::False => Filter::True,
            Filter::Not { filter } => *filter,
            other => Filter::Not {
                filter: Box::new(other),
            },
        }
    }

    /// Complement of an equality leaf, kept as a leaf where possible.
    fn negate_leaf(filter: Filter) -> Filter {
        match filter {
            Filter::Eq { field, value } => Filter::Ne { field, value },
            other => Filter::negate(other),
        }
    }

    /// In-memory evaluation against a concrete instance.
    pub fn matches(&self, resource: &Resource) -> bool {
        match self {
            Filter::True => true,
            Filter::False => false,
            Filter::Eq { field, value } => condition::values_equal(&field.value_of(resource), value),
            Filter::Ne { field, value } => !condition::values_equal(&field.value_of(resource), value),
            Filter::Compare { field, cmp, value } => {
                condition::compare_numbers(cmp.as_bin_op(), &field.value_of(resource), value)
            }
            Filter::In { field, values } => {
                let actual = field.value_of(resource);
                values.iter().any(|v| condition::values_equal(&actual, v))
            }
            Filter::And { filters } => filters.iter().all(|f| f.matches(resource)),
            Filter::Or { filters } => filters.iter().any(|f| f.matches(resource)),
            Filter::Not { filter } => !filter.matches(resource),
        }
    }
}

// ─── Renderers ──────────────────────────────────────────────────────────

/// Prisma-style `where` object.
///
/// Prisma drops NULL columns from `not`, `notIn` and `NOT`, so negation is
/// pushed down to the leaves and every negated leaf that should keep rows
/// with a missing attribute carries an explicit `{field: null}` branch.
pub fn to_orm_filter(filter: &Filter) -> Value {
    render_orm(filter, false)
}

fn render_orm(filter: &Filter, negated: bool) -> Value {
    match (filter, negated) {
        (Filter::True, false) | (Filter::False, true) => json!({}),
        (Filter::False, false) | (Filter::True, true) => json!({ "OR": [] }),
        (Filter::Eq { field, value }, false) | (Filter::Ne { field, value }, true) => {
            field_object(field, value.clone())
        }
        (Filter::Eq { field, value }, true) | (Filter::Ne { field, value }, false) => {
            if value.is_null() {
                field_object(field, json!({ "not": null }))
            } else {
                or_null(field, json!({ "not": value }))
            }
        }
        (Filter::Compare { field, cmp, value }, false) => {
            field_object(field, json!({ cmp.orm(): value }))
        }
        (Filter::Compare { field, cmp, value }, true) => json!({
            "OR": [
                field_object(field, Value::Null),
                { "NOT": field_object(field, json!({ cmp.orm(): value })) },
            ]
        }),
        (Filter::In { field, values }, negated) => {
            let non_null: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
            let has_null = non_null.len() < values.len();
            match (negated, has_null, non_null.is_empty()) {
                (false, false, true) => json!({ "OR": [] }),
                (false, false, false) => field_object(field, json!({ "in": non_null })),
                (false, true, true) => field_object(field, Value::Null),
                (false, true, false) => json!({
                    "OR": [
                        field_object(field, Value::Null),
                        field_object(field, json!({ "in": non_null })),
                    ]
                }),
                (true, false, true) => json!({}),
                (true, false, false) => or_null(field, json!({ "notIn": non_null })),
                (true, true, true) => field_object(field, json!({ "not": null })),
                (true, true, false) => field_object(field, json!({ "notIn": non_null })),
            }
        }
        (Filter::And { filters }, false) | (Filter::Or { filters }, true) => json!({
            "AND": filters.iter().map(|f| render_orm(f, negated)).collect::<Vec<_>>()
        }),
        (Filter::Or { filters }, false) | (Filter::And { filters }, true) => json!({
            "OR": filters.iter().map(|f| render_orm(f, negated)).collect::<Vec<_>>()
        }),
        (Filter::Not { filter }, negated) => render_orm(filter, !negated),
    }
}

/// `{field: null}` or `{field: condition}`.
fn or_null(field: &Field, condition: Value) -> Value {
    json!({
        "OR": [
            field_object(field, Value::Null),
            field_object(field, condition),
        ]
    })
}

fn field_object(field: &Field, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(field.name().to_string(), value);
    Value::Object(map)
}

/// A WHERE-clause body with `$n` placeholders and their bound values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlFragment {
    pub clause: String,
    pub params: Vec<Value>,
}

pub fn to_sql_where(filter: &Filter) -> SqlFragment {
    let mut params = Vec::new();
    let clause = render_sql(filter, &mut params);
    SqlFragment { clause, params }
}

fn render_sql(filter: &Filter, params: &mut Vec<Value>) -> String {
    match filter {
        Filter::True => "TRUE".to_string(),
        Filter::False => "FALSE".to_string(),
        Filter::Eq { field, value } if value.is_null() => format!("{} IS NULL", quote(field)),
        Filter::Eq { field, value } => {
            format!("COALESCE({} = {}, FALSE)", quote(field), bind(value, params))
        }
        Filter::Ne { field, value } if value.is_null() => format!("{} IS NOT NULL", quote(field)),
        Filter::Ne { field, value } => {
            format!("COALESCE({} <> {}, TRUE)", quote(field), bind(value, params))
        }
        Filter::Compare { field, cmp, value } => format!(
            "COALESCE({} {} {}, FALSE)",
            quote(field),
            cmp.sql(),
            bind(value, params)
        ),
        Filter::In { field, values } => {
            let non_null: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
            let mut parts = Vec::new();
            if non_null.len() < values.len() {
                parts.push(format!("{} IS NULL", quote(field)));
            }
            if !non_null.is_empty() {
                let placeholders: Vec<String> =
                    non_null.into_iter().map(|v| bind(v, params)).collect();
                parts.push(format!(
                    "COALESCE({} IN ({}), FALSE)",
                    quote(field),
                    placeholders.join(", ")
                ));
            }
            match parts.len() {
                0 => "FALSE".to_string(),
                1 => parts.remove(0),
                _ => format!("({})", parts.join(" OR ")),
            }
        }
        Filter::And { filters } => join_sql(filters, " AND ", params),
        Filter::Or { filters } => join_sql(filters, " OR ", params),
        Filter::Not { filter } => format!("NOT ({})", render_sql(filter, params)),
    }
}

fn bind(value: &Value, params: &mut Vec<Value>) -> String {
    params.push(value.clone());
    format!("${}", params.len())
}

fn join_sql(filters: &[Filter], sep: &str, params: &mut Vec<Value>) -> String {
    let parts: Vec<String> = filters.iter().map(|f| render_sql(f, params)).collect();
    format!("({})", parts.join(sep))
}

fn quote(field: &Field) -> String {
    format!("\"{}\"", field.name().replace('"', "\"\""))
}

// ─── Translation ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannerMode {
    /// Fail with `Unplannable` so the caller can evaluate row by row.
    #[default]
    Strict,
    /// Drop unplannable allow rules; unplannable deny rules hide everything.
    Narrow,
}

enum Operand {
    Const(Value),
    Field(Field),
}

struct Translator<'a> {
    principal: &'a Principal,
    /// Condition context without a resource instance.
    context: &'a Value,
    kind: &'a str,
}

type Translated = Result<Filter, String>;

impl Translator<'_> {
    fn rule_condition(&self, cond: &RuleCondition) -> Translated {
        match cond {
            RuleCondition::Always => Ok(Filter::True),
            RuleCondition::AttributeEquals { attribute, value } => Ok(Filter::Eq {
                field: Field::Attribute(attribute.clone()),
                value: value.clone(),
            }),
            RuleCondition::AttributeMatch {
                resource_attribute,
                principal_attribute,
            } => match self.principal.attributes.get(principal_attribute) {
                None | Some(Value::Null) => Ok(Filter::False),
                Some(expected) => Ok(Filter::Eq {
                    field: Field::Attribute(resource_attribute.clone()),
                    value: expected.clone(),
                }),
            },
            RuleCondition::Owner { attribute } => Ok(Filter::Eq {
                field: Field::Attribute(attribute.clone()),
                value: Value::String(self.principal.id.clone()),
            }),
            RuleCondition::Expression(cond) => self.expr(&cond.expr),
            RuleCondition::All(items) => Ok(Filter::and(
                items
                    .iter()
                    .map(|c| self.rule_condition(c))
                    .collect::<Result<_, _>>()?,
            )),
            RuleCondition::Any(items) => Ok(Filter::or(
                items
                    .iter()
                    .map(|c| self.rule_condition(c))
                    .collect::<Result<_, _>>()?,
            )),
            RuleCondition::Not(inner) => Ok(Filter::negate(self.rule_condition(inner)?)),
        }
    }

    fn expr(&self, expr: &Expr) -> Translated {
        match expr {
            Expr::Literal(_) | Expr::List(_) | Expr::Path(_) => match self.operand(expr)? {
                Operand::Const(v) => Ok(Filter::constant(condition::truthy(&v))),
                Operand::Field(field) => Ok(Filter::Eq {
                    field,
                    value: Value::Bool(true),
                }),
            },
            Expr::UnaryNot(inner) => Ok(Filter::negate(self.expr(inner)?)),
            Expr::BinOp { op, left, right } => match op {
                BinOp::And => Ok(Filter::and(vec![self.expr(left)?, self.expr(right)?])),
                BinOp::Or => Ok(Filter::or(vec![self.expr(left)?, self.expr(right)?])),
                BinOp::Eq | BinOp::Ne => {
                    let eq = self.equality(left, right)?;
                    Ok(if *op == BinOp::Ne { Filter::negate_leaf(eq) } else { eq })
                }
                ordering => self.ordering(*ordering, left, right),
            },
            Expr::In {
                element,
                collection,
            } => match (self.operand(element)?, self.operand(collection)?) {
                (Operand::Const(e), Operand::Const(c)) => {
                    Ok(Filter::constant(condition::contains(&c, &e)))
                }
                (Operand::Field(field), Operand::Const(Value::Array(values))) => {
                    Ok(if values.is_empty() {
                        Filter::False
                    } else {
                        Filter::In { field, values }
                    })
                }
                (Operand::Field(_), Operand::Const(_)) => Ok(Filter::False),
                (_, Operand::Field(field)) => Err(format!(
                    "membership test against array-valued resource attribute `{}`",
                    field.name()
                )),
            },
        }
    }

    fn equality(&self, left: &Expr, right: &Expr) -> Translated {
        match (self.operand(left)?, self.operand(right)?) {
            (Operand::Const(a), Operand::Const(b)) => {
                Ok(Filter::constant(condition::values_equal(&a, &b)))
            }
            (Operand::Field(field), Operand::Const(value))
            | (Operand::Const(value), Operand::Field(field)) => Ok(Filter::Eq { field, value }),
            (Operand::Field(a), Operand::Field(b)) => Err(format!(
                "compares resource fields `{}` and `{}` with each other",
                a.name(),
                b.name()
            )),
        }
    }

    fn ordering(&self, op: BinOp, left: &Expr, right: &Expr) -> Translated {
        let (op, field, value) = match (self.operand(left)?, self.operand(right)?) {
            (Operand::Const(a), Operand::Const(b)) => {
                return Ok(Filter::constant(condition::compare_numbers(op, &a, &b)))
            }
            (Operand::Field(field), Operand::Const(value)) => (op, field, value),
            (Operand::Const(value), Operand::Field(field)) => (op.flipped(), field, value),
            (Operand::Field(a), Operand::Field(b)) => {
                return Err(format!(
                    "compares resource fields `{}` and `{}` with each other",
                    a.name(),
                    b.name()
                ))
            }
        };
        let Some(cmp) = CompareOp::from_bin_op(op) else {
            return Err("unsupported comparison operator".into());
        };
        if !value.is_number() {
            return Ok(Filter::False);
        }
        Ok(Filter::Compare { field, cmp, value })
    }

    fn operand(&self, expr: &Expr) -> Result<Operand, String> {
        match expr {
            Expr::Literal(v) => Ok(Operand::Const(v.clone())),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match self.operand(item)? {
                        Operand::Const(v) => values.push(v),
                        Operand::Field(f) => {
                            return Err(format!(
                                "list literal contains resource field `{}`",
                                f.name()
                            ))
                        }
                    }
                }
                Ok(Operand::Const(Value::Array(values)))
            }
            Expr::Path(segments) => self.path(segments),
            other => match self.expr(other)? {
                Filter::True => Ok(Operand::Const(Value::Bool(true))),
                Filter::False => Ok(Operand::Const(Value::Bool(false))),
                _ => Err("boolean sub-expression over resource fields used as a value".into()),
            },
        }
    }

    fn path(&self, segments: &[String]) -> Result<Operand, String> {
        let root = segments.first().map(String::as_str);
        match root {
            Some("resource") => match &segments[1..] {
                [] => Err("references the whole resource object".into()),
                [f] if f == "kind" => Ok(Operand::Const(Value::String(self.kind.into()))),
                [f] if f == "id" => Ok(Operand::Field(Field::Id)),
                [f] if f == "attr" => Err("references the whole resource attribute map".into()),
                [f, name] if f == "attr" => Ok(Operand::Field(Field::Attribute(name.clone()))),
                [f, name, ..] if f == "attr" => {
                    Err(format!("nested path into resource attribute `{name}`"))
                }
                _ => Ok(Operand::Const(Value::Null)),
            },
            Some("request") => Err("depends on request data only known at evaluation time".into()),
            _ => Ok(Operand::Const(condition::lookup_path(self.context, segments).clone())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryPlanner {
    engine: Arc<PolicyEngine>,
    mode: PlannerMode,
}

impl QueryPlanner {
    pub fn new(engine: Arc<PolicyEngine>, mode: PlannerMode) -> Self {
        Self { engine, mode }
    }

    pub fn mode(&self) -> PlannerMode {
        self.mode
    }

    /// Filter over `resource_kind` instances equivalent to `evaluate` for `action`.
    pub fn plan_query(
        &self,
        principal: &Principal,
        resource_kind: &str,
        action: &str,
    ) -> Result<Filter, AuthzError> {
        let metrics = self.engine.metrics();
        if let Err(e) = validate_input(principal, resource_kind, action) {
            metrics.record_error(e.kind());
            return Err(e);
        }
        let tenant = match self.engine.tenant_of(principal) {
            Ok(t) => t,
            Err(e) => {
                metrics.record_error(e.kind());
                return Err(e);
            }
        };
        let config = self.engine.config();
        let derived = config.hierarchy.flatten(&principal.roles, &tenant);
        let context = condition_context(principal, &derived, resource_kind, None, &Value::Null);
        let translator = Translator {
            principal,
            context: &context,
            kind: resource_kind,
        };

        let mut allows = Vec::new();
        let mut denies = Vec::new();
        for rule in config
            .rules
            .iter()
            .filter(|r| r.applies_to(resource_kind, action, &derived))
        {
            let translated = match translator.rule_condition(&rule.condition) {
                Ok(filter) => filter,
                Err(reason) => match self.mode {
                    PlannerMode::Strict => {
                        metrics.record_error("unplannable");
                        metrics.record_plan("unplannable");
                        tracing::debug!(rule = %rule.id, %reason, "rule cannot be planned");
                        return Err(AuthzError::Unplannable {
                            rule: rule.id.clone(),
                            reason,
                        });
                    }
                    PlannerMode::Narrow => {
                        tracing::warn!(
                            rule = %rule.id,
                            %reason,
                            "rule cannot be planned; narrowing the result set"
                        );
                        match rule.effect {
                            Effect::Allow => Filter::False,
                            Effect::Deny => Filter::True,
                        }
                    }
                },
            };
            match rule.effect {
                Effect::Allow => allows.push(translated),
                Effect::Deny => denies.push(translated),
            }
        }

        let filter = Filter::and(vec![
            Filter::or(allows),
            Filter::negate(Filter::or(denies)),
        ]);
        let outcome = match filter {
            Filter::True => "always_allowed",
            Filter::False => "always_denied",
            _ => "conditional",
        };
        metrics.record_plan(outcome);
        tracing::debug!(
            principal = %principal.id,
            kind = resource_kind,
            action,
            outcome,
            "query planned"
        );
        Ok(filter)
    }
}
