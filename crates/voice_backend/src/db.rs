mod ids;
mod queries;
mod tables;

use crate::{Error, Result};
use anyhow::anyhow;
use chrono::{SubsecRound as _, Utc};
use sea_orm::{
    entity::prelude::*,
    sea_query::{Expr, OnConflict},
    ActiveValue, DatabaseConnection, DatabaseTransaction, IsolationLevel, QueryOrder, QuerySelect,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use sqlx::migrate::{Migrate, Migration, MigrationSource};
use sqlx::Connection;
use std::{
    collections::HashMap,
    future::Future,
    ops::Deref,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

pub use ids::*;
pub use queries::{
    conversations::NewConversationMessage,
    plans::{
        CurrentPlanDetail, PlanLevel, PlanParams, PlanUsage, UserPlanDetails, UserPlans,
        FREE_PLAN_LEVEL, FREE_PLAN_NAME,
    },
    prompts::{prompt_quota, NewPromptParams, PromptLimits, UserPrompts},
    token_usages::{TokenBreakdown, TokenUsage, TokenUsageDetails, TokenUsageResponse, UsageBreakdown},
    users::{NewUserParams, UserWithPlan, DEFAULT_VOICE, SUPPORTED_MODELS, SUPPORTED_VOICES},
};
pub use sea_orm::ConnectOptions;
pub use tables::*;

/// Handle to the persistent store.
///
/// Every public method opens its own transaction, so callers never hold a
/// connection between calls. Writes that must be atomic are done inside a
/// single [`Database::transaction`].
pub struct Database {
    options: ConnectOptions,
    pool: DatabaseConnection,
    query_timeout: Duration,
}

impl Database {
    /// Connects to the database with the given options.
    pub async fn new(options: ConnectOptions, query_timeout: Duration) -> Result<Self> {
        let pool = sea_orm::Database::connect(options.clone()).await?;
        Ok(Self {
            options,
            pool,
            query_timeout,
        })
    }

    /// Closes every pooled connection. Calls made afterwards fail with
    /// [`Error::StoreUnavailable`].
    pub async fn close(&self) -> Result<()> {
        self.pool.clone().close().await?;
        Ok(())
    }

    /// Runs the database migrations.
    pub async fn migrate(
        &self,
        migrations_path: &Path,
        ignore_checksum_mismatch: bool,
    ) -> anyhow::Result<Vec<(Migration, Duration)>> {
        let migrations = MigrationSource::resolve(migrations_path)
            .await
            .map_err(|err| anyhow!("failed to load migrations: {err:?}"))?;

        let mut connection = sqlx::PgConnection::connect(self.options.get_url()).await?;

        connection.ensure_migrations_table().await?;
        let applied_migrations: HashMap<_, _> = connection
            .list_applied_migrations()
            .await?
            .into_iter()
            .map(|migration| (migration.version, migration))
            .collect();

        let mut new_migrations = Vec::new();
        for migration in migrations {
            match applied_migrations.get(&migration.version) {
                Some(applied_migration) => {
                    if migration.checksum != applied_migration.checksum
                        && !ignore_checksum_mismatch
                    {
                        anyhow::bail!(
                            "checksum mismatch for applied migration {}",
                            migration.description
                        );
                    }
                }
                None => {
                    let started_at = Instant::now();
                    connection.apply(&migration).await?;
                    new_migrations.push((migration, started_at.elapsed()));
                }
            }
        }

        Ok(new_migrations)
    }

    /// Runs `f` inside a transaction that commits when `f` succeeds and rolls
    /// back when it fails. Writes are never retried; a serialization failure
    /// comes back as [`Error::TransactionConflict`].
    pub async fn transaction<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Send + FnOnce(TransactionHandle) -> Fut,
        Fut: Send + Future<Output = Result<T>>,
    {
        let body = async {
            let (tx, result) = self.with_transaction(f).await?;
            match result {
                Ok(result) => {
                    tx.commit().await?;
                    Ok(result)
                }
                Err(error) => {
                    tx.rollback().await?;
                    Err(error)
                }
            }
        };

        self.run(body).await
    }

    async fn with_transaction<F, Fut, T>(&self, f: F) -> Result<(DatabaseTransaction, Result<T>)>
    where
        F: Send + FnOnce(TransactionHandle) -> Fut,
        Fut: Send + Future<Output = Result<T>>,
    {
        // Row locks taken with `FOR UPDATE` do the serializing, so read
        // committed is enough and concurrent deductions wait instead of failing.
        let tx = self
            .pool
            .begin_with_config(Some(IsolationLevel::ReadCommitted), None)
            .await?;

        let mut tx = Arc::new(Some(tx));
        let result = f(TransactionHandle(tx.clone())).await;
        let Some(tx) = Arc::get_mut(&mut tx).and_then(|tx| tx.take()) else {
            return Err(anyhow!(
                "couldn't complete transaction because it's still in use"
            ))?;
        };

        Ok((tx, result))
    }

    /// Bounds `future` by the configured query deadline. Dropping the future
    /// drops any open transaction, which rolls it back.
    async fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.query_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(Error::StoreUnavailable(format!(
                "query timed out after {:?}",
                self.query_timeout
            ))),
        }
    }
}

/// The current time at the precision every supported store keeps, so that
/// timestamps written by different queries compare consistently.
pub(crate) fn now() -> DateTimeUtc {
    Utc::now().trunc_subsecs(6)
}

pub struct TransactionHandle(Arc<Option<DatabaseTransaction>>);

impl Deref for TransactionHandle {
    type Target = DatabaseTransaction;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref().as_ref().unwrap()
    }
}

const SERIALIZATION_FAILURE_CODE: &str = "40001";
const DEADLOCK_DETECTED_CODE: &str = "40P01";
const SQLITE_BUSY_CODE: &str = "5";
const SQLITE_BUSY_SNAPSHOT_CODE: &str = "517";
const SQLITE_LOCKED_CODE: &str = "6";

/// Sorts a driver error into the service's error taxonomy.
pub(crate) fn classify_db_error(error: DbErr) -> Error {
    let unavailable = match &error {
        DbErr::RecordNotFound(what) => return Error::NotFound(what.clone()),
        DbErr::ConnectionAcquire(acquire_error) => Some(acquire_error.to_string()),
        DbErr::Conn(runtime_error) => Some(runtime_error.to_string()),
        DbErr::Exec(sea_orm::RuntimeErr::SqlxError(sqlx_error))
        | DbErr::Query(sea_orm::RuntimeErr::SqlxError(sqlx_error)) => {
            let code = sqlx_error
                .as_database_error()
                .and_then(|error| error.code())
                .map(|code| code.into_owned());
            if is_conflict_code(code.as_deref()) {
                return Error::TransactionConflict;
            }
            is_connectivity_error(sqlx_error).then(|| sqlx_error.to_string())
        }
        _ => None,
    };

    match unavailable {
        Some(message) => Error::StoreUnavailable(message),
        None => Error::Database(error),
    }
}

fn is_conflict_code(code: Option<&str>) -> bool {
    matches!(
        code,
        Some(SERIALIZATION_FAILURE_CODE)
            | Some(DEADLOCK_DETECTED_CODE)
            | Some(SQLITE_BUSY_CODE)
            | Some(SQLITE_BUSY_SNAPSHOT_CODE)
            | Some(SQLITE_LOCKED_CODE)
    )
}

fn is_connectivity_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    )
}
