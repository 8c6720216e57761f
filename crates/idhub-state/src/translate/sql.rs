// Canonical queries and store operations rendered as parameterized SQL.
// Values only ever travel as bound parameters; identifiers come from the
// static field mapping of each entity type.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use idhub_core::entity::{
    CREATED_AT, FieldDef, FieldKind, ID, LEASE_EXPIRES_AT, LEASE_OWNER, StatefulEntity,
    UPDATED_AT,
};
use idhub_core::lease::Caller;
use idhub_core::query::{
    Criterion, Operator, QuerySpec, ResolvedCriterion, Scalar, SortOrder, resolve_filter,
    resolve_sort,
};
use idhub_core::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${index}"),
        }
    }

    /// Case-insensitive pattern match, matching the in-memory evaluator.
    fn like(self) -> &'static str {
        match self {
            Dialect::Sqlite => "LIKE",
            Dialect::Postgres => "ILIKE",
        }
    }

    /// Nulls sort lowest on every backend.
    fn order(self, order: SortOrder) -> &'static str {
        match (self, order) {
            (Dialect::Sqlite, SortOrder::Asc) => "ASC",
            (Dialect::Sqlite, SortOrder::Desc) => "DESC",
            (Dialect::Postgres, SortOrder::Asc) => "ASC NULLS FIRST",
            (Dialect::Postgres, SortOrder::Desc) => "DESC NULLS LAST",
        }
    }

    fn claim_lock(self) -> &'static str {
        match self {
            Dialect::Sqlite => "",
            Dialect::Postgres => " FOR UPDATE SKIP LOCKED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Text(Option<String>),
    Int(Option<i64>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

struct Builder {
    dialect: Dialect,
    sql: String,
    params: Vec<SqlParam>,
}

impl Builder {
    fn new(dialect: Dialect, sql: impl Into<String>) -> Self {
        Self {
            dialect,
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    fn bind(&mut self, param: SqlParam) -> &mut Self {
        self.params.push(param);
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
        self
    }

    fn bind_text(&mut self, value: &str) -> &mut Self {
        self.bind(SqlParam::Text(Some(value.to_string())))
    }

    fn bind_int(&mut self, value: i64) -> &mut Self {
        self.bind(SqlParam::Int(Some(value)))
    }

    fn bind_time(&mut self, value: DateTime<Utc>) -> &mut Self {
        self.bind_int(value.timestamp_millis())
    }

    fn finish(self) -> SqlStatement {
        SqlStatement {
            sql: self.sql,
            params: self.params,
        }
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Column values of `entity`, in field mapping order.
pub fn encode_row<E: StatefulEntity>(entity: &E) -> StoreResult<Vec<(&'static FieldDef, SqlParam)>> {
    let document = serde_json::to_value(entity).map_err(StoreError::unavailable)?;
    Ok(E::all_fields()
        .map(|field| {
            let value = document.pointer(field.pointer).filter(|v| !v.is_null());
            let param = match field.kind {
                FieldKind::Text => SqlParam::Text(value.map(|v| match v {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })),
                FieldKind::Integer | FieldKind::Timestamp | FieldKind::State => {
                    SqlParam::Int(value.and_then(Value::as_i64))
                }
                FieldKind::Json => SqlParam::Text(value.map(Value::to_string)),
            };
            (field, param)
        })
        .collect())
}

/// Typed column access over a backend row.
pub trait RowSource {
    fn text(&self, column: &str) -> StoreResult<Option<String>>;
    fn int(&self, column: &str) -> StoreResult<Option<i64>>;
}

pub fn decode_row<E: StatefulEntity>(row: &impl RowSource) -> StoreResult<E> {
    let mut document = Value::Object(Map::new());
    for field in E::all_fields() {
        let value = match field.kind {
            FieldKind::Text => row.text(field.column)?.map(Value::String),
            FieldKind::Integer | FieldKind::Timestamp | FieldKind::State => {
                row.int(field.column)?.map(Value::from)
            }
            FieldKind::Json => row
                .text(field.column)?
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(StoreError::unavailable)?,
        };
        if let Some(value) = value {
            set_pointer(&mut document, field.pointer, value);
        }
    }
    serde_json::from_value(document).map_err(StoreError::unavailable)
}

fn set_pointer(root: &mut Value, pointer: &str, value: Value) {
    let mut segments: Vec<&str> = pointer.split('/').skip(1).collect();
    let Some(last) = segments.pop() else {
        return;
    };
    let mut node = root;
    for segment in segments {
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Value::Object(map) = node {
        map.insert(last.to_string(), value);
    }
}

fn lease_free(builder: &mut Builder, now: DateTime<Utc>) {
    builder
        .push("(lease_owner IS NULL OR lease_expires_at <= ")
        .bind_time(now)
        .push(")");
}

fn lease_condition(builder: &mut Builder, caller: Caller<'_>, now: DateTime<Utc>) {
    match caller {
        Caller::LeaseOwner(owner) => {
            builder
                .push("lease_owner = ")
                .bind_text(owner)
                .push(" AND lease_expires_at > ")
                .bind_time(now);
        }
        Caller::Admin => lease_free(builder, now),
    }
}

fn where_criterion(builder: &mut Builder, criterion: &ResolvedCriterion) {
    let column = criterion.field.column;
    let scalar_param = |scalar: &Scalar| match scalar {
        Scalar::Int(value) => SqlParam::Int(Some(*value)),
        Scalar::Text(value) => SqlParam::Text(Some(value.clone())),
        Scalar::Null => SqlParam::Text(None),
    };
    let first = criterion.values.first();

    match (criterion.operator, first) {
        (Operator::Eq, Some(Scalar::Null)) => {
            builder.push(column).push(" IS NULL");
        }
        (Operator::Ne, Some(Scalar::Null)) => {
            builder.push(column).push(" IS NOT NULL");
        }
        (Operator::In, _) if criterion.values.is_empty() => {
            builder.push("1 = 0");
        }
        (Operator::In, _) => {
            builder.push(column).push(" IN (");
            for (index, value) in criterion.values.iter().enumerate() {
                if index > 0 {
                    builder.push(", ");
                }
                builder.bind(scalar_param(value));
            }
            builder.push(")");
        }
        (operator, Some(value)) => {
            let op = match operator {
                Operator::Eq => "=",
                Operator::Ne => "<>",
                Operator::Like => builder.dialect.like(),
                Operator::Lt => "<",
                Operator::Le => "<=",
                Operator::Gt => ">",
                Operator::Ge => ">=",
                Operator::In => unreachable!("handled above"),
            };
            builder
                .push(column)
                .push(" ")
                .push(op)
                .push(" ")
                .bind(scalar_param(value));
        }
        (_, None) => {
            builder.push("1 = 0");
        }
    }
}

fn where_filter(builder: &mut Builder, criteria: &[ResolvedCriterion]) {
    for (index, criterion) in criteria.iter().enumerate() {
        builder.push(if index == 0 { " WHERE " } else { " AND " });
        where_criterion(builder, criterion);
    }
}

/// Statement factory for one entity table.
#[derive(Debug, Clone, Copy)]
pub struct Statements<E> {
    dialect: Dialect,
    _entity: PhantomData<fn() -> E>,
}

impl<E: StatefulEntity> Statements<E> {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            _entity: PhantomData,
        }
    }

    fn builder(&self, sql: impl Into<String>) -> Builder {
        Builder::new(self.dialect, sql)
    }

    pub fn insert(&self, entity: &E, now: DateTime<Utc>) -> StoreResult<SqlStatement> {
        let row = encode_row(entity)?;
        let columns: Vec<&str> = row.iter().map(|(field, _)| field.column).collect();
        let mut builder = self.builder(format!(
            "INSERT INTO {} ({}) VALUES (",
            E::TABLE,
            columns.join(", ")
        ));
        for (index, (field, param)) in row.into_iter().enumerate() {
            if index > 0 {
                builder.push(", ");
            }
            let param = if field.column == UPDATED_AT.column {
                SqlParam::Int(Some(now.timestamp_millis()))
            } else if field.column == LEASE_OWNER.column {
                SqlParam::Text(None)
            } else if field.column == LEASE_EXPIRES_AT.column {
                SqlParam::Int(None)
            } else {
                param
            };
            builder.bind(param);
        }
        builder.push(")");
        Ok(builder.finish())
    }

    pub fn find(&self, id: &str) -> SqlStatement {
        let mut builder = self.builder(format!("SELECT * FROM {} WHERE id = ", E::TABLE));
        builder.bind_text(id);
        builder.finish()
    }

    /// Rewrites every column except the id, creation time and lease,
    /// conditional on `caller` being allowed to write.
    pub fn overwrite(
        &self,
        entity: &E,
        caller: Caller<'_>,
        release: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<SqlStatement> {
        let row = encode_row(entity)?;
        let mut builder = self.builder(format!("UPDATE {} SET ", E::TABLE));
        let mut first = true;
        for (field, param) in row {
            if [ID.column, CREATED_AT.column, LEASE_OWNER.column, LEASE_EXPIRES_AT.column]
                .contains(&field.column)
            {
                continue;
            }
            if !first {
                builder.push(", ");
            }
            first = false;
            builder.push(field.column).push(" = ");
            if field.column == UPDATED_AT.column {
                builder.bind_time(now);
            } else {
                builder.bind(param);
            }
        }
        if release {
            builder.push(", lease_owner = NULL, lease_expires_at = NULL");
        }
        builder.push(" WHERE id = ").bind_text(entity.id()).push(" AND ");
        lease_condition(&mut builder, caller, now);
        Ok(builder.finish())
    }

    pub fn release(&self, id: &str, owner: &str, now: DateTime<Utc>) -> SqlStatement {
        let mut builder = self.builder(format!(
            "UPDATE {} SET lease_owner = NULL, lease_expires_at = NULL WHERE id = ",
            E::TABLE
        ));
        builder
            .bind_text(id)
            .push(" AND (lease_owner = ")
            .bind_text(owner)
            .push(" OR ");
        lease_free(&mut builder, now);
        builder.push(")");
        builder.finish()
    }

    pub fn delete(&self, id: &str, caller: Caller<'_>, now: DateTime<Utc>) -> SqlStatement {
        let mut builder = self.builder(format!("DELETE FROM {} WHERE id = ", E::TABLE));
        builder.bind_text(id).push(" AND ");
        lease_condition(&mut builder, caller, now);
        builder.finish()
    }

    pub fn select(&self, spec: &QuerySpec) -> StoreResult<SqlStatement> {
        let criteria = resolve_filter::<E>(&spec.filter)?;
        let sort = resolve_sort::<E>(spec)?;
        let mut builder = self.builder(format!("SELECT * FROM {}", E::TABLE));
        where_filter(&mut builder, &criteria);
        let order: Vec<String> = sort
            .keys
            .iter()
            .map(|(field, order)| format!("{} {}", field.column, self.dialect.order(*order)))
            .collect();
        builder
            .push(" ORDER BY ")
            .push(&order.join(", "))
            .push(" LIMIT ")
            .bind_int(to_i64(spec.page_size()))
            .push(" OFFSET ")
            .bind_int(to_i64(spec.offset));
        Ok(builder.finish())
    }

    pub fn count(&self, filter: &[Criterion]) -> StoreResult<SqlStatement> {
        let criteria = resolve_filter::<E>(filter)?;
        let mut builder = self.builder(format!("SELECT COUNT(*) FROM {}", E::TABLE));
        where_filter(&mut builder, &criteria);
        Ok(builder.finish())
    }

    /// Single-statement claim: pick the least recently updated free rows in
    /// `states` and lease them, re-checking the lease in the outer update.
    pub fn claim(
        &self,
        max: usize,
        states: &[i32],
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SqlStatement {
        let table = E::TABLE;
        let mut builder = self.builder(format!("UPDATE {table} SET lease_owner = "));
        builder
            .bind_text(owner)
            .push(", lease_expires_at = ")
            .bind_time(expires_at)
            .push(&format!(" WHERE id IN (SELECT id FROM {table} WHERE state IN ("));
        for (index, state) in states.iter().enumerate() {
            if index > 0 {
                builder.push(", ");
            }
            builder.bind_int(i64::from(*state));
        }
        builder.push(") AND ");
        lease_free(&mut builder, now);
        builder
            .push(" ORDER BY updated_at, created_at, id LIMIT ")
            .bind_int(to_i64(max))
            .push(self.dialect.claim_lock())
            .push(") AND ");
        lease_free(&mut builder, now);
        builder.push(" RETURNING *");
        builder.finish()
    }

    pub fn acquire(
        &self,
        id: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SqlStatement {
        let mut builder = self.builder(format!("UPDATE {} SET lease_owner = ", E::TABLE));
        builder
            .bind_text(owner)
            .push(", lease_expires_at = ")
            .bind_time(expires_at)
            .push(" WHERE id = ")
            .bind_text(id)
            .push(" AND (lease_owner = ")
            .bind_text(owner)
            .push(" OR ");
        lease_free(&mut builder, now);
        builder.push(")");
        builder.finish()
    }

    pub fn leased_by(&self, id: &str, owner: &str, now: DateTime<Utc>) -> SqlStatement {
        let mut builder = self.builder(format!("SELECT COUNT(*) FROM {} WHERE id = ", E::TABLE));
        builder
            .bind_text(id)
            .push(" AND ")
            .push("lease_owner = ")
            .bind_text(owner)
            .push(" AND lease_expires_at > ")
            .bind_time(now);
        builder.finish()
    }
}
