// Evaluates canonical queries against serialized entities. Shared by the
// in-memory and document stores.

use std::cmp::Ordering;

use idhub_core::entity::StatefulEntity;
use idhub_core::query::{
    Criterion, Operator, QuerySpec, ResolvedCriterion, ResolvedSort, Scalar, SortOrder,
    like_matches, resolve_filter, resolve_sort, scalar_at,
};
use idhub_core::{StoreError, StoreResult};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    criteria: Vec<ResolvedCriterion>,
    sort: ResolvedSort,
    offset: usize,
    limit: usize,
}

impl CompiledQuery {
    pub fn compile<E: StatefulEntity>(spec: &QuerySpec) -> StoreResult<Self> {
        Ok(Self {
            criteria: resolve_filter::<E>(&spec.filter)?,
            sort: resolve_sort::<E>(spec)?,
            offset: spec.offset,
            limit: spec.page_size(),
        })
    }

    /// Filter only, no paging; for counting.
    pub fn filter<E: StatefulEntity>(filter: &[Criterion]) -> StoreResult<Self> {
        Ok(Self {
            criteria: resolve_filter::<E>(filter)?,
            sort: resolve_sort::<E>(&QuerySpec::default())?,
            offset: 0,
            limit: usize::MAX,
        })
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.criteria
            .iter()
            .all(|criterion| criterion_matches(criterion, document))
    }

    /// Filters, sorts and pages `entities`.
    pub fn apply<E: StatefulEntity>(&self, entities: impl IntoIterator<Item = E>) -> StoreResult<Vec<E>> {
        let mut rows = Vec::new();
        for entity in entities {
            let document = serde_json::to_value(&entity).map_err(StoreError::unavailable)?;
            if self.matches(&document) {
                let keys: Vec<Scalar> = self
                    .sort
                    .keys
                    .iter()
                    .map(|(field, _)| scalar_at(&document, field))
                    .collect();
                rows.push((keys, entity));
            }
        }

        rows.sort_by(|(left, _), (right, _)| self.compare_keys(left, right));
        Ok(rows
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .map(|(_, entity)| entity)
            .collect())
    }

    pub fn count<E: StatefulEntity>(&self, entities: impl IntoIterator<Item = E>) -> StoreResult<u64> {
        let mut count = 0;
        for entity in entities {
            let document = serde_json::to_value(&entity).map_err(StoreError::unavailable)?;
            if self.matches(&document) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn compare_keys(&self, left: &[Scalar], right: &[Scalar]) -> Ordering {
        for ((_, order), (l, r)) in self.sort.keys.iter().zip(left.iter().zip(right)) {
            // Nulls sort lowest, as SQLite orders them.
            let ordering = match order {
                SortOrder::Asc => l.cmp(r),
                SortOrder::Desc => r.cmp(l),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

fn criterion_matches(criterion: &ResolvedCriterion, document: &Value) -> bool {
    let actual = scalar_at(document, criterion.field);
    let Some(expected) = criterion.values.first() else {
        // `in` with an empty set matches nothing.
        return false;
    };

    match criterion.operator {
        Operator::Eq if *expected == Scalar::Null => actual == Scalar::Null,
        Operator::Ne if *expected == Scalar::Null => actual != Scalar::Null,
        _ if actual == Scalar::Null => false,
        Operator::Eq => actual == *expected,
        Operator::Ne => actual != *expected,
        Operator::In => criterion.values.contains(&actual),
        Operator::Like => match (&actual, expected) {
            (Scalar::Text(text), Scalar::Text(pattern)) => like_matches(pattern, text),
            _ => false,
        },
        Operator::Lt => actual < *expected,
        Operator::Le => actual <= *expected,
        Operator::Gt => actual > *expected,
        Operator::Ge => actual >= *expected,
    }
}
