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

//! Connection pooling and migrations for the dual-backend (Postgres/SQLite)
//! storage layer. Mirrors the teacher's `database::connection` module,
//! trimmed of multi-tenant schema support this engine has no use for.

pub mod backend;
pub mod schema;
pub mod universal_types;

use tracing::info;

#[cfg(feature = "postgres")]
use deadpool_diesel::postgres::{Manager as PgManager, Pool as PgPool, Runtime as PgRuntime};
#[cfg(feature = "sqlite")]
use deadpool_diesel::sqlite::{Manager as SqliteManager, Pool as SqlitePool, Runtime as SqliteRuntime};

pub use backend::{AnyPool, BackendType};

#[cfg(feature = "postgres")]
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
#[cfg(feature = "postgres")]
pub const POSTGRES_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/postgres");

#[cfg(feature = "sqlite")]
use diesel_migrations::{embed_migrations as embed_migrations_sqlite, EmbeddedMigrations as SqliteEmbeddedMigrations};
#[cfg(feature = "sqlite")]
pub const SQLITE_MIGRATIONS: SqliteEmbeddedMigrations = embed_migrations_sqlite!("migrations/sqlite");

/// A pooled connection handle to either backend.
#[derive(Clone, Debug)]
pub struct Database {
    pool: AnyPool,
    backend: BackendType,
}

impl Database {
    /// Opens a connection pool, detecting the backend from `connection_string`.
    ///
    /// # Panics
    /// Panics if the pool cannot be constructed (bad URL, unreachable host at
    /// pool-build time for backends that eagerly connect).
    pub fn new(connection_string: &str, max_size: u32) -> Self {
        let backend = BackendType::from_url(connection_string);

        match backend {
            BackendType::Postgres => {
                #[cfg(feature = "postgres")]
                {
                    let manager = PgManager::new(connection_string, PgRuntime::Tokio1);
                    let pool = PgPool::builder(manager)
                        .max_size(max_size as usize)
                        .build()
                        .expect("failed to create PostgreSQL connection pool");
                    info!("PostgreSQL connection pool initialized (size: {})", max_size);
                    Self {
                        pool: AnyPool::Postgres(pool),
                        backend,
                    }
                }
                #[cfg(not(feature = "postgres"))]
                panic!("postgres:// URL given but the 'postgres' feature is not enabled");
            }
            BackendType::Sqlite => {
                #[cfg(feature = "sqlite")]
                {
                    let path = connection_string
                        .strip_prefix("sqlite://")
                        .unwrap_or(connection_string);
                    let manager = SqliteManager::new(path, SqliteRuntime::Tokio1);
                    // SQLite serializes writers regardless of pool size; a single
                    // connection avoids spurious "database is locked" errors and
                    // makes the claim transaction's IMMEDIATE lock meaningful.
                    let pool = SqlitePool::builder(manager)
                        .max_size(1)
                        .build()
                        .expect("failed to create SQLite connection pool");
                    info!("SQLite connection pool initialized (size: 1)");
                    Self {
                        pool: AnyPool::Sqlite(pool),
                        backend,
                    }
                }
                #[cfg(not(feature = "sqlite"))]
                panic!("sqlite URL given but the 'sqlite' feature is not enabled");
            }
        }
    }

    pub fn backend(&self) -> BackendType {
        self.backend
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    #[cfg(feature = "postgres")]
    pub async fn get_postgres_connection(
        &self,
    ) -> Result<
        deadpool::managed::Object<PgManager>,
        deadpool::managed::PoolError<deadpool_diesel::Error>,
    > {
        let pool = self.pool.expect_postgres();
        pool.get().await
    }

    #[cfg(feature = "sqlite")]
    pub async fn get_sqlite_connection(
        &self,
    ) -> Result<
        deadpool::managed::Object<SqliteManager>,
        deadpool::managed::PoolError<deadpool_diesel::Error>,
    > {
        let pool = self.pool.expect_sqlite();
        pool.get().await
    }

    /// Runs embedded migrations for the detected backend, creating
    /// `collections`/`tasks` if they don't already exist.
    pub async fn run_migrations(&self) -> Result<(), String> {
        use diesel_migrations::MigrationHarness;

        match &self.pool {
            #[cfg(feature = "postgres")]
            AnyPool::Postgres(pool) => {
                let conn = pool.get().await.map_err(|e| e.to_string())?;
                conn.interact(|conn| {
                    conn.run_pending_migrations(POSTGRES_MIGRATIONS)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                })
                .await
                .map_err(|e| e.to_string())??;
            }
            #[cfg(feature = "sqlite")]
            AnyPool::Sqlite(pool) => {
                let conn = pool.get().await.map_err(|e| e.to_string())?;
                conn.interact(|conn| {
                    use diesel::connection::SimpleConnection;
                    // WAL mode allows concurrent reads during the sweep's writes;
                    // busy_timeout keeps the `IMMEDIATE` claim transaction from
                    // failing fast under the storage worker pool's contention.
                    conn.batch_execute("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=30000;")
                        .map_err(|e| e.to_string())?;
                    conn.run_pending_migrations(SQLITE_MIGRATIONS)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                })
                .await
                .map_err(|e| e.to_string())??;
            }
            #[allow(unreachable_patterns)]
            _ => return Err("no database backend compiled in".to_string()),
        }
        Ok(())
    }
}
