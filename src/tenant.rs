//! Tenant model and enumeration.
//!
//! Tenants are isolated failure domains: the dispatcher iterates them one at
//! a time and a failure in one tenant's batch never blocks the others.
//! Inactive tenants are skipped entirely; what happens to their backlog is a
//! policy decision (see [`InactiveTenantPolicy`](crate::config::InactiveTenantPolicy)).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use crate::error::Error;

#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub active: bool,
}

impl Tenant {
    pub async fn get_id(
        db: &mut SqliteConnection,
        name: impl AsRef<str>,
    ) -> Result<Option<i64>, Error> {
        Ok(sqlx::query_scalar("SELECT id FROM tenants WHERE name = $1")
            .bind(name.as_ref())
            .fetch_optional(db)
            .await?)
    }

    pub async fn insert(db: &mut SqliteConnection, name: impl AsRef<str>) -> Result<i64, Error> {
        Ok(
            sqlx::query_scalar("INSERT INTO tenants (name) VALUES ($1) RETURNING id")
                .bind(name.as_ref())
                .fetch_one(&mut *db)
                .await?,
        )
    }

    pub async fn ensure(db: &mut SqliteConnection, name: impl AsRef<str>) -> Result<i64, Error> {
        if let Some(id) = Self::get_id(db, &name).await? {
            return Ok(id);
        }

        Self::insert(db, name).await
    }

    pub async fn set_active(
        db: &mut SqliteConnection,
        name: impl AsRef<str>,
        active: bool,
    ) -> Result<(), Error> {
        let result = sqlx::query("UPDATE tenants SET active = $1 WHERE name = $2")
            .bind(active)
            .bind(name.as_ref())
            .execute(db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::tenant_not_found(name.as_ref()));
        }

        Ok(())
    }

    pub async fn list(db: &mut SqliteConnection) -> Result<Vec<Tenant>, Error> {
        Ok(sqlx::query_as("SELECT * FROM tenants ORDER BY id")
            .fetch_all(db)
            .await?)
    }

    pub async fn list_active(db: &mut SqliteConnection) -> Result<Vec<Tenant>, Error> {
        Ok(
            sqlx::query_as("SELECT * FROM tenants WHERE active = TRUE ORDER BY id")
                .fetch_all(db)
                .await?,
        )
    }
}

/// Supplies the set of tenants the dispatcher iterates each cycle.
///
/// The engine ships a SQLite-backed implementation; embedders with an
/// external tenant registry provide their own.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn active_tenants(&self) -> Result<Vec<Tenant>, Error>;
}

/// Directory backed by the engine's own `tenants` table.
#[derive(Clone)]
pub struct SqliteTenantDirectory {
    pool: SqlitePool,
}

impl SqliteTenantDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantDirectory for SqliteTenantDirectory {
    async fn active_tenants(&self) -> Result<Vec<Tenant>, Error> {
        let mut conn = self.pool.acquire().await?;
        Tenant::list_active(&mut conn).await
    }
}
