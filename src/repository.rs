/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Durable storage of Tasks grouped into Collections (§4.1).
//!
//! Two backend-specific implementations share one [`Repository`] trait and
//! one set of domain types; only the claim transaction's locking strategy
//! differs (Postgres: `SELECT ... FOR UPDATE SKIP LOCKED`; SQLite: ordinary
//! transactions serialized by the single-connection pool in
//! [`crate::database::Database`]).

use std::time::Duration;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use uuid::Uuid;

use crate::database::schema::{collections, tasks};
use crate::database::universal_types::{UniversalTimestamp, UniversalUuid};
use crate::database::Database;
use crate::error::RepoError;
use crate::instance::InstanceId;
use crate::models::{ClaimedCollection, Collection, Task};

/// Sharding and retry knobs for the storage layer (§4.1, §6).
#[derive(Debug, Clone, Copy)]
pub struct RepositoryOptions {
    pub max_count_tasks_in_collection: i64,
    pub max_retries_on_deadlock: u32,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            max_count_tasks_in_collection: 1000,
            max_retries_on_deadlock: 10,
        }
    }
}

/// Durable storage of Tasks grouped into Collections, with transactional
/// claim semantics (§4.1).
#[async_trait]
pub trait Repository: Send + Sync {
    /// Persists a new Task. If `is_taken` is true the owning Collection is
    /// claimed for this instance in the same write.
    async fn create(&self, task: &Task, is_taken: bool) -> Result<(), RepoError>;

    /// Removes the given Tasks, returning the count actually removed.
    async fn delete(&self, task_ids: &[UniversalUuid]) -> Result<u64, RepoError>;

    /// Hard-deletes tasks that have fired.
    async fn confirm_execution(&self, task_ids: &[UniversalUuid]) -> Result<u64, RepoError>;

    /// Claims and returns one unclaimed Collection whose `exec_time` is
    /// within `horizon` of now, or `None` if none remain (cursor
    /// exhausted). The Rust rendering of the source's `Collections.Next()`
    /// cursor: rather than a stateful cursor object, each call claims
    /// (at most) one Collection in a single round trip, which composes
    /// naturally with `?` and needs no `is_end` out-parameter.
    async fn claim_next_collection(
        &self,
        horizon: Duration,
    ) -> Result<Option<ClaimedCollection>, RepoError>;
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = collections)]
struct CollectionRow {
    id: UniversalUuid,
    exec_time: UniversalTimestamp,
    task_count: i64,
    taken_by_instance: Option<i64>,
}

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = tasks)]
struct TaskRow {
    id: UniversalUuid,
    collection_id: UniversalUuid,
    exec_time: UniversalTimestamp,
}

fn row_to_collection(row: &CollectionRow) -> Collection {
    Collection {
        id: row.id,
        exec_time: row.exec_time,
        task_count: row.task_count,
        taken_by_instance: row.taken_by_instance.map(InstanceId::new),
    }
}

fn row_to_task(row: &TaskRow, taken_by_instance: Option<InstanceId>) -> Task {
    Task {
        id: row.id,
        exec_time: row.exec_time,
        taken_by_instance,
    }
}

/// Classifies a transactional failure against the repository's error
/// taxonomy. Unique-constraint violations are attributed to `task_id`
/// since task ids, not collection ids, are caller-supplied and thus the
/// only ones that can collide; serialization failures and SQLite's lock
/// contention are both transient and retried by the TaskManager.
fn classify_diesel_error(task_id: UniversalUuid, err: DieselError) -> RepoError {
    match &err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            RepoError::Dup(task_id.as_uuid())
        }
        DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => {
            RepoError::Deadlock
        }
        DieselError::DatabaseError(_, info)
            if info.message().contains("locked") || info.message().contains("busy") =>
        {
            RepoError::Deadlock
        }
        _ => RepoError::Database(err),
    }
}

/// Diesel-backed [`Repository`], selecting a Postgres or SQLite code path
/// at runtime from [`Database::backend`].
pub struct DieselRepository {
    database: Database,
    instance: InstanceId,
    options: RepositoryOptions,
}

impl DieselRepository {
    pub fn new(database: Database, instance: InstanceId, options: RepositoryOptions) -> Self {
        Self {
            database,
            instance,
            options,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }
}

#[async_trait]
impl Repository for DieselRepository {
    async fn create(&self, task: &Task, is_taken: bool) -> Result<(), RepoError> {
        crate::dispatch_backend!(
            self.database.backend(),
            self.create_postgres(task, is_taken).await,
            self.create_sqlite(task, is_taken).await
        )
    }

    async fn delete(&self, task_ids: &[UniversalUuid]) -> Result<u64, RepoError> {
        crate::dispatch_backend!(
            self.database.backend(),
            self.remove_tasks_postgres(task_ids).await,
            self.remove_tasks_sqlite(task_ids).await
        )
    }

    async fn confirm_execution(&self, task_ids: &[UniversalUuid]) -> Result<u64, RepoError> {
        // Hard-delete is hard-delete: ConfirmExecution has no durable state
        // of its own to update beyond what Delete already does (§3).
        self.delete(task_ids).await
    }

    async fn claim_next_collection(
        &self,
        horizon: Duration,
    ) -> Result<Option<ClaimedCollection>, RepoError> {
        crate::dispatch_backend!(
            self.database.backend(),
            self.claim_next_collection_postgres(horizon).await,
            self.claim_next_collection_sqlite(horizon).await
        )
    }
}

#[cfg(feature = "postgres")]
impl DieselRepository {
    async fn pg_connection(
        &self,
    ) -> Result<deadpool::managed::Object<deadpool_diesel::postgres::Manager>, RepoError> {
        let mut attempt = 0u32;
        loop {
            match self.database.get_postgres_connection().await {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt + 1 < self.options.max_retries_on_deadlock => {
                    attempt += 1;
                    tracing::debug!(attempt, error = %e, "retrying postgres pool checkout");
                    tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
                }
                Err(e) => return Err(RepoError::ConnectionPool(e.to_string())),
            }
        }
    }

    async fn create_postgres(&self, task: &Task, is_taken: bool) -> Result<(), RepoError> {
        let conn = self.pg_connection().await?;
        let max_count = self.options.max_count_tasks_in_collection;
        let instance_id = self.instance.as_i64();
        let task_id = task.id;
        let exec_time = task.exec_time;

        conn.interact(move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let existing: Option<CollectionRow> = if is_taken {
                    collections::table
                        .filter(collections::exec_time.eq(exec_time))
                        .filter(collections::taken_by_instance.eq(instance_id))
                        .filter(collections::task_count.lt(max_count))
                        .order(collections::id.desc())
                        .first(conn)
                        .optional()?
                } else {
                    collections::table
                        .filter(collections::exec_time.eq(exec_time))
                        .filter(collections::taken_by_instance.is_null())
                        .filter(collections::task_count.lt(max_count))
                        .order(collections::id.desc())
                        .first(conn)
                        .optional()?
                };

                let collection_id = match existing {
                    Some(row) => {
                        diesel::update(collections::table.find(row.id))
                            .set(collections::task_count.eq(collections::task_count + 1))
                            .execute(conn)?;
                        row.id
                    }
                    None => {
                        let new_row = CollectionRow {
                            id: UniversalUuid::new_v4(),
                            exec_time,
                            task_count: 1,
                            taken_by_instance: if is_taken { Some(instance_id) } else { None },
                        };
                        diesel::insert_into(collections::table)
                            .values(&new_row)
                            .execute(conn)?;
                        new_row.id
                    }
                };

                diesel::insert_into(tasks::table)
                    .values(&TaskRow {
                        id: task_id,
                        collection_id,
                        exec_time,
                    })
                    .execute(conn)?;

                Ok(())
            })
        })
        .await
        .map_err(|e| RepoError::ConnectionPool(e.to_string()))?
        .map_err(|e| classify_diesel_error(task_id, e))
    }

    async fn remove_tasks_postgres(&self, task_ids: &[UniversalUuid]) -> Result<u64, RepoError> {
        let conn = self.pg_connection().await?;
        let ids = task_ids.to_vec();

        conn.interact(move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| remove_tasks_txn_postgres(conn, &ids))
        })
        .await
        .map_err(|e| RepoError::ConnectionPool(e.to_string()))?
        .map_err(RepoError::Database)
    }

    async fn claim_next_collection_postgres(
        &self,
        horizon: Duration,
    ) -> Result<Option<ClaimedCollection>, RepoError> {
        use diesel::sql_types::{BigInt, Text};

        #[derive(QueryableByName, Debug, Clone)]
        struct ClaimRow {
            #[diesel(sql_type = Text)]
            id: String,
            #[diesel(sql_type = BigInt)]
            exec_time: i64,
            #[diesel(sql_type = BigInt)]
            task_count: i64,
        }

        let conn = self.pg_connection().await?;
        let cutoff = UniversalTimestamp::now().as_secs() + horizon.as_secs() as i64;
        let instance_id = self.instance.as_i64();

        let claimed: Option<(ClaimRow, Vec<TaskRow>)> = conn
            .interact(move |conn| {
                conn.transaction::<_, DieselError, _>(|conn| {
                    let row: Option<ClaimRow> = diesel::sql_query(
                        r#"
                        WITH claimed AS (
                            SELECT id FROM collections
                            WHERE taken_by_instance IS NULL AND exec_time <= $1
                            ORDER BY exec_time ASC
                            LIMIT 1
                            FOR UPDATE SKIP LOCKED
                        )
                        UPDATE collections
                        SET taken_by_instance = $2
                        FROM claimed
                        WHERE collections.id = claimed.id
                        RETURNING collections.id, collections.exec_time, collections.task_count
                        "#,
                    )
                    .bind::<BigInt, _>(cutoff)
                    .bind::<BigInt, _>(instance_id)
                    .get_result(conn)
                    .optional()?;

                    let Some(row) = row else {
                        return Ok(None);
                    };

                    let task_rows: Vec<TaskRow> = tasks::table
                        .filter(tasks::collection_id.eq(UniversalUuid(
                            Uuid::parse_str(&row.id).map_err(|_| DieselError::NotFound)?,
                        )))
                        .load(conn)?;

                    Ok(Some((row, task_rows)))
                })
            })
            .await
            .map_err(|e| RepoError::ConnectionPool(e.to_string()))?
            .map_err(RepoError::Database)?;

        Ok(claimed.map(|(row, task_rows)| {
            let collection = Collection {
                id: UniversalUuid(Uuid::parse_str(&row.id).expect("valid uuid from storage")),
                exec_time: UniversalTimestamp::from_secs(row.exec_time),
                task_count: row.task_count,
                taken_by_instance: Some(self.instance),
            };
            let tasks = task_rows
                .iter()
                .map(|t| row_to_task(t, Some(self.instance)))
                .collect();
            ClaimedCollection { collection, tasks }
        }))
    }
}

#[cfg(feature = "sqlite")]
impl DieselRepository {
    async fn sqlite_connection(
        &self,
    ) -> Result<deadpool::managed::Object<deadpool_diesel::sqlite::Manager>, RepoError> {
        let mut attempt = 0u32;
        loop {
            match self.database.get_sqlite_connection().await {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt + 1 < self.options.max_retries_on_deadlock => {
                    attempt += 1;
                    tracing::debug!(attempt, error = %e, "retrying sqlite pool checkout");
                    tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
                }
                Err(e) => return Err(RepoError::ConnectionPool(e.to_string())),
            }
        }
    }

    async fn create_sqlite(&self, task: &Task, is_taken: bool) -> Result<(), RepoError> {
        let conn = self.sqlite_connection().await?;
        let max_count = self.options.max_count_tasks_in_collection;
        let instance_id = self.instance.as_i64();
        let task_id = task.id;
        let exec_time = task.exec_time;

        conn.interact(move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let existing: Option<CollectionRow> = if is_taken {
                    collections::table
                        .filter(collections::exec_time.eq(exec_time))
                        .filter(collections::taken_by_instance.eq(instance_id))
                        .filter(collections::task_count.lt(max_count))
                        .order(collections::id.desc())
                        .first(conn)
                        .optional()?
                } else {
                    collections::table
                        .filter(collections::exec_time.eq(exec_time))
                        .filter(collections::taken_by_instance.is_null())
                        .filter(collections::task_count.lt(max_count))
                        .order(collections::id.desc())
                        .first(conn)
                        .optional()?
                };

                let collection_id = match existing {
                    Some(row) => {
                        diesel::update(collections::table.find(row.id))
                            .set(collections::task_count.eq(collections::task_count + 1))
                            .execute(conn)?;
                        row.id
                    }
                    None => {
                        let new_row = CollectionRow {
                            id: UniversalUuid::new_v4(),
                            exec_time,
                            task_count: 1,
                            taken_by_instance: if is_taken { Some(instance_id) } else { None },
                        };
                        diesel::insert_into(collections::table)
                            .values(&new_row)
                            .execute(conn)?;
                        new_row.id
                    }
                };

                diesel::insert_into(tasks::table)
                    .values(&TaskRow {
                        id: task_id,
                        collection_id,
                        exec_time,
                    })
                    .execute(conn)?;

                Ok(())
            })
        })
        .await
        .map_err(|e| RepoError::ConnectionPool(e.to_string()))?
        .map_err(|e| classify_diesel_error(task_id, e))
    }

    async fn remove_tasks_sqlite(&self, task_ids: &[UniversalUuid]) -> Result<u64, RepoError> {
        let conn = self.sqlite_connection().await?;
        let ids = task_ids.to_vec();

        conn.interact(move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| remove_tasks_txn_sqlite(conn, &ids))
        })
        .await
        .map_err(|e| RepoError::ConnectionPool(e.to_string()))?
        .map_err(RepoError::Database)
    }

    // The pool behind a SQLite `Database` holds exactly one connection (see
    // `database::Database::new`), so every `interact` call here is already
    // serialized with every other one: no two claim transactions can ever
    // run concurrently, which gives us the same disjoint-claim guarantee
    // Postgres gets from `FOR UPDATE SKIP LOCKED`.
    async fn claim_next_collection_sqlite(
        &self,
        horizon: Duration,
    ) -> Result<Option<ClaimedCollection>, RepoError> {
        let conn = self.sqlite_connection().await?;
        let cutoff = UniversalTimestamp::now().as_secs() + horizon.as_secs() as i64;
        let instance_id = self.instance.as_i64();

        let claimed: Option<(CollectionRow, Vec<TaskRow>)> = conn
            .interact(move |conn| {
                conn.transaction::<_, DieselError, _>(|conn| {
                    let candidate: Option<CollectionRow> = collections::table
                        .filter(collections::taken_by_instance.is_null())
                        .filter(collections::exec_time.le(UniversalTimestamp::from_secs(cutoff)))
                        .order(collections::exec_time.asc())
                        .first(conn)
                        .optional()?;

                    let Some(candidate) = candidate else {
                        return Ok(None);
                    };

                    diesel::update(collections::table.find(candidate.id))
                        .set(collections::taken_by_instance.eq(Some(instance_id)))
                        .execute(conn)?;

                    let task_rows: Vec<TaskRow> = tasks::table
                        .filter(tasks::collection_id.eq(candidate.id))
                        .load(conn)?;

                    Ok(Some((candidate, task_rows)))
                })
            })
            .await
            .map_err(|e| RepoError::ConnectionPool(e.to_string()))?
            .map_err(RepoError::Database)?;

        Ok(claimed.map(|(row, task_rows)| {
            let mut collection = row_to_collection(&row);
            collection.taken_by_instance = Some(self.instance);
            let tasks = task_rows
                .iter()
                .map(|t| row_to_task(t, Some(self.instance)))
                .collect();
            ClaimedCollection { collection, tasks }
        }))
    }
}

// Shared delete/confirm body, duplicated per backend: remove the given
// tasks, then shrink or drop their owning Collections so empty shards
// don't accumulate.
#[cfg(feature = "postgres")]
fn remove_tasks_txn_postgres(
    conn: &mut diesel::pg::PgConnection,
    ids: &[UniversalUuid],
) -> Result<u64, DieselError> {
    let collection_ids: Vec<UniversalUuid> = tasks::table
        .filter(tasks::id.eq_any(ids))
        .select(tasks::collection_id)
        .distinct()
        .load(conn)?;

    let deleted = diesel::delete(tasks::table.filter(tasks::id.eq_any(ids))).execute(conn)?;

    for cid in collection_ids {
        let remaining: i64 = tasks::table
            .filter(tasks::collection_id.eq(cid))
            .count()
            .get_result(conn)?;
        if remaining == 0 {
            diesel::delete(collections::table.find(cid)).execute(conn)?;
        } else {
            diesel::update(collections::table.find(cid))
                .set(collections::task_count.eq(remaining))
                .execute(conn)?;
        }
    }

    Ok(deleted as u64)
}

#[cfg(feature = "sqlite")]
fn remove_tasks_txn_sqlite(
    conn: &mut diesel::sqlite::SqliteConnection,
    ids: &[UniversalUuid],
) -> Result<u64, DieselError> {
    let collection_ids: Vec<UniversalUuid> = tasks::table
        .filter(tasks::id.eq_any(ids))
        .select(tasks::collection_id)
        .distinct()
        .load(conn)?;

    let deleted = diesel::delete(tasks::table.filter(tasks::id.eq_any(ids))).execute(conn)?;

    for cid in collection_ids {
        let remaining: i64 = tasks::table
            .filter(tasks::collection_id.eq(cid))
            .count()
            .get_result(conn)?;
        if remaining == 0 {
            diesel::delete(collections::table.find(cid)).execute(conn)?;
        } else {
            diesel::update(collections::table.find(cid))
                .set(collections::task_count.eq(remaining))
                .execute(conn)?;
        }
    }

    Ok(deleted as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    async fn sqlite_repo() -> DieselRepository {
        let db = Database::new(":memory:", 1);
        db.run_migrations().await.expect("migrations");
        DieselRepository::new(db, InstanceId::new(1), RepositoryOptions::default())
    }

    #[tokio::test]
    async fn create_then_claim_returns_the_task() {
        let repo = sqlite_repo().await;
        let task = Task::new(UniversalTimestamp::now());
        repo.create(&task, false).await.expect("create");

        let claimed = repo
            .claim_next_collection(Duration::from_secs(3600))
            .await
            .expect("claim")
            .expect("a collection");

        assert_eq!(claimed.tasks.len(), 1);
        assert_eq!(claimed.tasks[0].id, task.id);
        assert!(claimed.collection.is_claimed());
    }

    #[tokio::test]
    async fn claimed_collection_is_not_returned_again() {
        let repo = sqlite_repo().await;
        let task = Task::new(UniversalTimestamp::now());
        repo.create(&task, false).await.expect("create");

        repo.claim_next_collection(Duration::from_secs(3600))
            .await
            .expect("claim")
            .expect("first claim");

        let second = repo
            .claim_next_collection(Duration::from_secs(3600))
            .await
            .expect("claim");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn beyond_horizon_tasks_are_not_claimed() {
        let repo = sqlite_repo().await;
        let far_future = UniversalTimestamp::now() + chrono::Duration::hours(1);
        let task = Task::new(far_future);
        repo.create(&task, false).await.expect("create");

        let claimed = repo
            .claim_next_collection(Duration::from_secs(5))
            .await
            .expect("claim");
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn create_and_delete_leaves_no_trace() {
        let repo = sqlite_repo().await;
        let task = Task::new(UniversalTimestamp::now());
        repo.create(&task, false).await.expect("create");

        let removed = repo.delete(&[task.id]).await.expect("delete");
        assert_eq!(removed, 1);

        let claimed = repo
            .claim_next_collection(Duration::from_secs(3600))
            .await
            .expect("claim");
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn collection_seals_at_max_count() {
        let mut options = RepositoryOptions::default();
        options.max_count_tasks_in_collection = 2;
        let db = Database::new(":memory:", 1);
        db.run_migrations().await.expect("migrations");
        let repo = DieselRepository::new(db, InstanceId::new(1), options);

        let exec_time = UniversalTimestamp::now();
        for _ in 0..3 {
            let task = Task::new(exec_time);
            repo.create(&task, false).await.expect("create");
        }

        let first = repo
            .claim_next_collection(Duration::from_secs(3600))
            .await
            .expect("claim")
            .expect("a collection");
        assert_eq!(first.tasks.len(), 2);

        let second = repo
            .claim_next_collection(Duration::from_secs(3600))
            .await
            .expect("claim")
            .expect("a second, sealed collection");
        assert_eq!(second.tasks.len(), 1);
    }

    #[tokio::test]
    async fn immediate_add_creates_a_taken_collection() {
        let repo = sqlite_repo().await;
        let task = Task::new(UniversalTimestamp::now());
        repo.create(&task, true).await.expect("create");

        // An already-taken collection is invisible to claim_next_collection,
        // which only surfaces unclaimed collections.
        let claimed = repo
            .claim_next_collection(Duration::from_secs(3600))
            .await
            .expect("claim");
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn duplicate_task_id_is_reported_as_dup() {
        let repo = sqlite_repo().await;
        let task = Task::new(UniversalTimestamp::now());
        repo.create(&task, false).await.expect("create");

        let err = repo.create(&task, false).await.unwrap_err();
        assert!(matches!(err, RepoError::Dup(id) if id == task.id.as_uuid()));
    }
}
