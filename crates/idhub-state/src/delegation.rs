// Shared `EntityStore` implementation for the sqlx backends. The SQL comes
// from `translate::sql::Statements`; only the driver types differ.

macro_rules! impl_sql_entity_store {
    ($store:ident, $db:ty, $row:ty, $dialect:expr) => {
        impl $crate::translate::sql::RowSource for $row {
            fn text(&self, column: &str) -> idhub_core::StoreResult<Option<String>> {
                sqlx::Row::try_get::<Option<String>, _>(self, column)
                    .map_err(idhub_core::StoreError::unavailable)
            }

            fn int(&self, column: &str) -> idhub_core::StoreResult<Option<i64>> {
                sqlx::Row::try_get::<Option<i64>, _>(self, column)
                    .map_err(idhub_core::StoreError::unavailable)
            }
        }

        impl<E: idhub_core::StatefulEntity> $store<E> {
            pub fn new(pool: sqlx::Pool<$db>, clock: idhub_core::SharedClock) -> Self {
                Self {
                    pool,
                    clock,
                    statements: $crate::translate::sql::Statements::new($dialect),
                }
            }

            pub fn pool(&self) -> &sqlx::Pool<$db> {
                &self.pool
            }

            fn prepare(
                statement: &$crate::translate::SqlStatement,
            ) -> sqlx::query::Query<'_, $db, <$db as sqlx::Database>::Arguments<'_>> {
                let mut query = sqlx::query::<$db>(&statement.sql);
                for param in &statement.params {
                    query = match param {
                        $crate::translate::SqlParam::Text(value) => query.bind(value.clone()),
                        $crate::translate::SqlParam::Int(value) => query.bind(*value),
                    };
                }
                query
            }

            async fn execute(
                &self,
                statement: $crate::translate::SqlStatement,
            ) -> idhub_core::StoreResult<u64> {
                Self::prepare(&statement)
                    .execute(&self.pool)
                    .await
                    .map(|done| done.rows_affected())
                    .map_err(idhub_core::StoreError::unavailable)
            }

            async fn fetch_all(
                &self,
                statement: $crate::translate::SqlStatement,
            ) -> idhub_core::StoreResult<Vec<E>> {
                let rows = Self::prepare(&statement)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(idhub_core::StoreError::unavailable)?;
                rows.iter()
                    .map(|row| $crate::translate::sql::decode_row::<E>(row))
                    .collect()
            }

            async fn fetch_count(
                &self,
                statement: $crate::translate::SqlStatement,
            ) -> idhub_core::StoreResult<u64> {
                let row = Self::prepare(&statement)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(idhub_core::StoreError::unavailable)?;
                let count: i64 = sqlx::Row::try_get(&row, 0usize)
                    .map_err(idhub_core::StoreError::unavailable)?;
                Ok(u64::try_from(count).unwrap_or_default())
            }

            /// Explains why a conditional write touched no row.
            async fn rejection(&self, id: &str) -> idhub_core::StoreError {
                use idhub_core::StatefulEntity as _;
                let now = self.clock.now();
                match self.fetch_all(self.statements.find(id)).await {
                    Ok(rows) => match rows.into_iter().next() {
                        None => idhub_core::StoreError::not_found(E::ENTITY_TYPE, id),
                        Some(entity) => $crate::memory::stale::<E>(
                            id,
                            entity
                                .meta()
                                .active_lease(now)
                                .map(idhub_core::lease::LeaseConflict::from),
                        ),
                    },
                    Err(err) => err,
                }
            }
        }

        #[async_trait::async_trait]
        impl<E: idhub_core::StatefulEntity> idhub_core::EntityStore<E> for $store<E> {
            async fn create(&self, entity: &E) -> idhub_core::StoreResult<()> {
                let statement = self.statements.insert(entity, self.clock.now())?;
                match Self::prepare(&statement).execute(&self.pool).await {
                    Ok(_) => Ok(()),
                    Err(sqlx::Error::Database(err)) if err.is_unique_violation() => Err(
                        idhub_core::StoreError::duplicate(E::ENTITY_TYPE, entity.id()),
                    ),
                    Err(err) => Err(idhub_core::StoreError::unavailable(err)),
                }
            }

            async fn find_by_id(&self, id: &str) -> idhub_core::StoreResult<Option<E>> {
                Ok(self
                    .fetch_all(self.statements.find(id))
                    .await?
                    .into_iter()
                    .next())
            }

            async fn update(
                &self,
                entity: &E,
                caller: idhub_core::Caller<'_>,
            ) -> idhub_core::StoreResult<()> {
                let statement = self
                    .statements
                    .overwrite(entity, caller, false, self.clock.now())?;
                if self.execute(statement).await? == 0 {
                    return Err(self.rejection(entity.id()).await);
                }
                Ok(())
            }

            async fn commit(&self, entity: &E, owner: &str) -> idhub_core::StoreResult<()> {
                let statement = self.statements.overwrite(
                    entity,
                    idhub_core::Caller::LeaseOwner(owner),
                    true,
                    self.clock.now(),
                )?;
                if self.execute(statement).await? == 0 {
                    return Err(self.rejection(entity.id()).await);
                }
                Ok(())
            }

            async fn release_lease(&self, id: &str, owner: &str) -> idhub_core::StoreResult<()> {
                let statement = self.statements.release(id, owner, self.clock.now());
                if self.execute(statement).await? == 0 {
                    return Err(self.rejection(id).await);
                }
                Ok(())
            }

            async fn delete(
                &self,
                id: &str,
                caller: idhub_core::Caller<'_>,
            ) -> idhub_core::StoreResult<()> {
                let statement = self.statements.delete(id, caller, self.clock.now());
                if self.execute(statement).await? == 0 {
                    return Err(self.rejection(id).await);
                }
                Ok(())
            }

            async fn query(
                &self,
                spec: &idhub_core::QuerySpec,
            ) -> idhub_core::StoreResult<Vec<E>> {
                self.fetch_all(self.statements.select(spec)?).await
            }

            async fn count(
                &self,
                filter: &[idhub_core::Criterion],
            ) -> idhub_core::StoreResult<u64> {
                self.fetch_count(self.statements.count(filter)?).await
            }

            async fn claim_next(
                &self,
                max: usize,
                states: &[E::State],
                owner: &str,
                lease_duration: std::time::Duration,
            ) -> idhub_core::StoreResult<Vec<E>> {
                use idhub_core::WorkflowState as _;
                if max == 0 || states.is_empty() {
                    return Ok(Vec::new());
                }
                let now = self.clock.now();
                let codes: Vec<i32> = states.iter().map(|state| state.code()).collect();
                let statement = self.statements.claim(
                    max,
                    &codes,
                    owner,
                    idhub_core::clock::expiry_after(now, lease_duration),
                    now,
                );
                let mut claimed = self.fetch_all(statement).await?;
                // RETURNING does not preserve the subquery order
                claimed.sort_by(|a, b| {
                    let (a, b) = (a.meta(), b.meta());
                    (a.updated_at, a.created_at, &a.id).cmp(&(b.updated_at, b.created_at, &b.id))
                });
                Ok(claimed)
            }

            async fn acquire_lease(
                &self,
                id: &str,
                owner: &str,
                duration: std::time::Duration,
            ) -> idhub_core::StoreResult<bool> {
                let now = self.clock.now();
                let statement = self.statements.acquire(
                    id,
                    owner,
                    idhub_core::clock::expiry_after(now, duration),
                    now,
                );
                if self.execute(statement).await? > 0 {
                    return Ok(true);
                }
                match self.rejection(id).await {
                    idhub_core::StoreError::StaleLease { .. } => Ok(false),
                    err => Err(err),
                }
            }

            async fn is_leased_by(&self, id: &str, owner: &str) -> idhub_core::StoreResult<bool> {
                let statement = self.statements.leased_by(id, owner, self.clock.now());
                Ok(self.fetch_count(statement).await? > 0)
            }
        }
    };
}

pub(crate) use impl_sql_entity_store;
