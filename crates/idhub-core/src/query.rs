// Canonical, backend-agnostic query model and the field resolution every
// translator shares.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{CREATED_AT, FieldDef, FieldKind, ID, StatefulEntity};
use crate::error::{StoreError, StoreResult};
use crate::state::WorkflowState;

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    In,
    Like,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::In => "in",
            Operator::Like => "like",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }
}

impl FromStr for Operator {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "=" | "==" | "eq" => Ok(Operator::Eq),
            "!=" | "<>" | "ne" => Ok(Operator::Ne),
            "in" => Ok(Operator::In),
            "like" => Ok(Operator::Like),
            "<" | "lt" => Ok(Operator::Lt),
            "<=" | "le" => Ok(Operator::Le),
            ">" | "gt" => Ok(Operator::Gt),
            ">=" | "ge" => Ok(Operator::Ge),
            other => Err(StoreError::unsupported(format!("unknown operator `{other}`"))),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `field operator value` condition. The operator stays a string until
/// resolution so that unknown operators surface as `UnsupportedQuery`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

impl Criterion {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: operator.as_str().to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuerySpec {
    pub filter: Vec<Criterion>,
    pub sort_field: Option<String>,
    pub sort_order: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, criterion: Criterion) -> Self {
        self.filter.push(criterion);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = Some(field.into());
        self.sort_order = order;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE)
    }
}

/// Comparable value after coercion to the field's kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scalar {
    Null,
    Int(i64),
    Text(String),
}

/// A criterion checked against the entity's field mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCriterion {
    pub field: &'static FieldDef,
    pub operator: Operator,
    /// One value, or the set for [`Operator::In`].
    pub values: Vec<Scalar>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSort {
    pub keys: Vec<(&'static FieldDef, SortOrder)>,
}

pub fn resolve_field<E: StatefulEntity>(name: &str) -> StoreResult<&'static FieldDef> {
    E::field(name).ok_or_else(|| {
        StoreError::unsupported(format!("unknown field `{name}` for {}", E::ENTITY_TYPE))
    })
}

pub fn resolve_filter<E: StatefulEntity>(
    filter: &[Criterion],
) -> StoreResult<Vec<ResolvedCriterion>> {
    filter.iter().map(resolve_criterion::<E>).collect()
}

pub fn resolve_criterion<E: StatefulEntity>(criterion: &Criterion) -> StoreResult<ResolvedCriterion> {
    let field = resolve_field::<E>(&criterion.field)?;
    let operator: Operator = criterion.operator.parse()?;

    if field.kind == FieldKind::Json {
        return Err(StoreError::unsupported(format!(
            "field `{}` cannot be filtered",
            field.name
        )));
    }
    if operator == Operator::Like && field.kind != FieldKind::Text {
        return Err(StoreError::unsupported(format!(
            "`like` requires a text field, `{}` is not",
            field.name
        )));
    }

    let values = match (operator, &criterion.value) {
        (Operator::In, Value::Array(items)) => items
            .iter()
            .map(|item| coerce::<E>(field, item))
            .collect::<StoreResult<Vec<_>>>()?,
        (Operator::In, _) => {
            return Err(StoreError::unsupported(format!(
                "`in` on `{}` requires an array value",
                field.name
            )));
        }
        (_, value) => vec![coerce::<E>(field, value)?],
    };

    if values.contains(&Scalar::Null) && !matches!(operator, Operator::Eq | Operator::Ne) {
        return Err(StoreError::unsupported(format!(
            "null can only be compared with `=` or `!=` on `{}`",
            field.name
        )));
    }
    Ok(ResolvedCriterion {
        field,
        operator,
        values,
    })
}

/// Requested sort key followed by the `createdAt`, `id` tie-breakers.
pub fn resolve_sort<E: StatefulEntity>(spec: &QuerySpec) -> StoreResult<ResolvedSort> {
    let mut keys = Vec::with_capacity(3);
    if let Some(name) = &spec.sort_field {
        let field = resolve_field::<E>(name)?;
        if field.kind == FieldKind::Json {
            return Err(StoreError::unsupported(format!(
                "field `{}` cannot be sorted",
                field.name
            )));
        }
        keys.push((field, spec.sort_order));
    }
    for tie_breaker in [&CREATED_AT, &ID] {
        if !keys.iter().any(|(field, _)| field.name == tie_breaker.name) {
            keys.push((tie_breaker, SortOrder::Asc));
        }
    }
    Ok(ResolvedSort { keys })
}

fn coerce<E: StatefulEntity>(field: &FieldDef, value: &Value) -> StoreResult<Scalar> {
    let mismatch = || {
        StoreError::unsupported(format!(
            "value {value} does not fit field `{}`",
            field.name
        ))
    };
    match (field.kind, value) {
        (_, Value::Null) => Ok(Scalar::Null),
        (FieldKind::Text, Value::String(text)) => Ok(Scalar::Text(text.clone())),
        (FieldKind::Text, Value::Number(number)) => Ok(Scalar::Text(number.to_string())),
        (FieldKind::Integer | FieldKind::Timestamp | FieldKind::State, Value::Number(number)) => {
            number.as_i64().map(Scalar::Int).ok_or_else(mismatch)
        }
        (FieldKind::State, Value::String(name)) => E::State::from_name(name)
            .map(|state| Scalar::Int(i64::from(state.code())))
            .or_else(|| name.parse::<i64>().ok().map(Scalar::Int))
            .ok_or_else(|| {
                StoreError::unsupported(format!(
                    "unknown state `{name}` for {}",
                    E::ENTITY_TYPE
                ))
            }),
        (FieldKind::Timestamp, Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map(|instant| Scalar::Int(instant.timestamp_millis()))
            .map_err(|_| mismatch()),
        (FieldKind::Integer, Value::String(raw)) => {
            raw.parse::<i64>().map(Scalar::Int).map_err(|_| mismatch())
        }
        _ => Err(mismatch()),
    }
}

/// Extracts the scalar a stored document holds for `field`.
pub fn scalar_at(document: &Value, field: &FieldDef) -> Scalar {
    match document.pointer(field.pointer) {
        None | Some(Value::Null) => Scalar::Null,
        Some(Value::String(text)) => Scalar::Text(text.clone()),
        Some(Value::Number(number)) => number
            .as_i64()
            .map(Scalar::Int)
            .unwrap_or_else(|| Scalar::Text(number.to_string())),
        Some(Value::Bool(flag)) => Scalar::Int(i64::from(*flag)),
        Some(other) => Scalar::Text(other.to_string()),
    }
}

/// SQL `LIKE` semantics (`%` any run, `_` one char), case-insensitive.
/// Linear backtracking on the last `%`, so runtime is O(pattern * text).
pub fn like_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    let (mut p, mut t) = (0, 0);
    // Position after the last `%` seen, and the text index it is matched up to
    let mut resume: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                p += 1;
                resume = Some((p, t));
            }
            Some('_') => {
                p += 1;
                t += 1;
            }
            Some(expected) if *expected == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match resume {
                Some((after_wildcard, matched_to)) => {
                    p = after_wildcard;
                    t = matched_to + 1;
                    resume = Some((after_wildcard, t));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}
