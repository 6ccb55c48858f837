use std::future::Future;
use std::pin::Pin;

use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqliteConnection, SqlitePool,
};
use uuid::Uuid;

use crate::{
    buffer::OutboxBuffer,
    config::Config,
    error::Error,
    message::{InboxMessage, OutboxMessage},
    tenant::{SqliteTenantDirectory, Tenant},
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How [`Service::process_inbound`] concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDisposition {
    /// Side effects ran and the dedup marker was committed.
    Processed,
    /// The message id was already in the inbox; nothing ran.
    AlreadyProcessed,
}

/// Engine façade: owns the pool, runs migrations, and exposes the
/// transactional entry points producers and consumers use.
pub struct Service {
    db: SqlitePool,
    config: Config,
}

impl Service {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let opts = if let Some(path) = &config.db_path {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { db: pool, config })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Tenant directory backed by this service's own store.
    pub fn tenant_directory(&self) -> SqliteTenantDirectory {
        SqliteTenantDirectory::new(self.db.clone())
    }

    pub async fn create_tenant(&self, name: impl AsRef<str>) -> Result<i64, Error> {
        let mut tx = self.db.begin().await?;

        let id = Tenant::insert(&mut tx, name).await?;

        tx.commit().await?;

        Ok(id)
    }

    pub async fn set_tenant_active(
        &self,
        name: impl AsRef<str>,
        active: bool,
    ) -> Result<(), Error> {
        let mut conn = self.db.acquire().await?;
        Tenant::set_active(&mut conn, name, active).await
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>, Error> {
        let mut conn = self.db.acquire().await?;
        Tenant::list(&mut conn).await
    }

    /// Flushes a deferred buffer and commits the rows in their own
    /// transaction.
    ///
    /// For callers whose unit of work carries no other writes. Callers with
    /// business writes must instead flush into their own transaction via
    /// [`OutboxMessage::insert_batch`], or the outbox guarantee is lost.
    pub async fn commit_buffered(
        &self,
        tenant: impl AsRef<str>,
        buffer: &mut OutboxBuffer,
    ) -> Result<Vec<i64>, Error> {
        let tenant = tenant.as_ref();

        let mut tx = self.db.begin().await?;

        let tenant_id = Tenant::get_id(&mut tx, tenant)
            .await?
            .ok_or_else(|| Error::tenant_not_found(tenant))?;

        let ids = OutboxMessage::insert_batch(&mut tx, tenant_id, buffer.flush(tenant)).await?;

        tx.commit().await?;

        Ok(ids)
    }

    /// Idempotent consumption of an inbound message.
    ///
    /// In one transaction: inserts the dedup marker, runs the consumer's side
    /// effects against the same connection, marks the row processed, commits.
    /// A duplicate id short-circuits to [`InboundDisposition::AlreadyProcessed`]
    /// without running the side effects. A side-effect failure rolls the whole
    /// transaction back, leaving no marker, so a later redelivery retries
    /// cleanly.
    pub async fn process_inbound<F>(
        &self,
        id: Uuid,
        message_type: &str,
        content: &str,
        side_effect: F,
    ) -> Result<InboundDisposition, Error>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<(), Error>>,
    {
        let mut tx = self.db.begin().await?;

        match InboxMessage::insert(&mut tx, id, message_type, content).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                tx.rollback().await?;
                return Ok(InboundDisposition::AlreadyProcessed);
            }
            Err(e) => return Err(e),
        }

        match side_effect(&mut tx).await {
            Ok(()) => {
                InboxMessage::mark_processed(&mut tx, id).await?;
                tx.commit().await?;
                Ok(InboundDisposition::Processed)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }
}
