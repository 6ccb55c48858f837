//! Background delivery loop.
//!
//! One dispatcher runs per process instance; any number of instances run the
//! identical loop against the same store. Correctness under concurrency comes
//! entirely from the atomic claim in [`OutboxMessage::claim_pending`], not
//! from in-process mutual exclusion.
//!
//! Each cycle: sleep for the polling interval, then for every active tenant
//! lease a batch, attempt each message, record failures immediately and mark
//! successes in one bulk write. A failure inside one tenant's batch is logged
//! and never blocks the remaining tenants. The cycle ends with a retention
//! sweep.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::codec::PayloadRegistry;
use crate::config::{Config, InactiveTenantPolicy};
use crate::error::Error;
use crate::message::{MessageKind, OutboxMessage};
use crate::tenant::{Tenant, TenantDirectory};
use crate::transport::{
    CommandTransport, DeliveryOutcome, NotificationTransport, OutboundEnvelope, MESSAGE_ID_HEADER,
};

pub struct Dispatcher {
    db: SqlitePool,
    registry: PayloadRegistry,
    commands: Arc<dyn CommandTransport>,
    notifications: Arc<dyn NotificationTransport>,
    tenants: Arc<dyn TenantDirectory>,
    config: Config,
    instance_id: String,
}

#[bon::bon]
impl Dispatcher {
    #[builder]
    pub fn new(
        db: SqlitePool,
        registry: PayloadRegistry,
        commands: Arc<dyn CommandTransport>,
        notifications: Arc<dyn NotificationTransport>,
        tenants: Arc<dyn TenantDirectory>,
        config: Config,
        instance_id: Option<String>,
    ) -> Self {
        let instance_id = instance_id
            .or_else(|| config.instance_id.clone())
            .unwrap_or_else(|| format!("outpost-{}", Uuid::new_v4()));

        Self {
            db,
            registry,
            commands,
            notifications,
            tenants,
            config,
            instance_id,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Runs polling cycles until `shutdown` fires.
    ///
    /// Cancellation mid-delivery aborts the current batch without recording a
    /// failure: claimed rows stay `Pending`, their leases expire, and another
    /// instance (or this one after restart) picks them up.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(instance = %self.instance_id, "dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(instance = %self.instance_id, "dispatcher stopped");
                    return;
                }
                _ = tokio::time::sleep(self.config.polling_interval()) => {}
            }

            self.run_cycle(&shutdown).await;
        }
    }

    /// One polling cycle: every active tenant, then the retention sweep.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) {
        let tenants = match self.tenants.active_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                warn!(error = %e, "failed to enumerate tenants, skipping cycle");
                return;
            }
        };

        for tenant in &tenants {
            if shutdown.is_cancelled() {
                return;
            }

            if let Err(e) = self.process_tenant(tenant, shutdown).await {
                warn!(tenant = %tenant.name, error = %e, "tenant batch failed");
            }
        }

        if let Err(e) = self.retention_sweep().await {
            warn!(error = %e, "retention sweep failed");
        }
    }

    /// Claims and delivers one batch for a single tenant.
    async fn process_tenant(
        &self,
        tenant: &Tenant,
        shutdown: &CancellationToken,
    ) -> Result<(), Error> {
        let batch = {
            let mut conn = self.db.acquire().await?;
            OutboxMessage::claim_pending(
                &mut conn,
                tenant.id,
                &self.instance_id,
                self.config.batch_size,
                self.config.claim_timeout(),
                self.config.max_retry_count,
            )
            .await?
        };

        if batch.is_empty() {
            return Ok(());
        }

        debug!(tenant = %tenant.name, claimed = batch.len(), "claimed batch");

        let mut sent = Vec::new();
        let mut failed = 0usize;
        let mut cancelled = false;

        for message in &batch {
            match self.attempt(message, shutdown).await {
                DeliveryOutcome::Delivered => sent.push(message.id),
                DeliveryOutcome::Cancelled => {
                    // Local shutdown, not a transport problem: no retry
                    // penalty, the lease simply expires.
                    cancelled = true;
                    break;
                }
                DeliveryOutcome::TransientFailure(reason) => {
                    failed += 1;
                    warn!(
                        id = message.id,
                        tenant = %tenant.name,
                        reason = %reason,
                        "delivery failed"
                    );

                    let mut conn = self.db.acquire().await?;
                    OutboxMessage::record_delivery_failure(
                        &mut conn,
                        message.id,
                        &reason,
                        self.config.max_retry_count,
                    )
                    .await?;
                }
                DeliveryOutcome::PermanentFailure(reason) => {
                    failed += 1;
                    warn!(
                        id = message.id,
                        tenant = %tenant.name,
                        reason = %reason,
                        "delivery failed permanently"
                    );

                    let mut conn = self.db.acquire().await?;
                    OutboxMessage::record_permanent_failure(
                        &mut conn,
                        message.id,
                        &reason,
                        self.config.max_retry_count,
                    )
                    .await?;
                }
            }
        }

        // Unmarked successes are redelivered after the lease expires; safe
        // because consumers dedup through their inbox.
        if !sent.is_empty() {
            let mut conn = self.db.acquire().await?;
            match OutboxMessage::mark_sent(&mut conn, &sent).await {
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to mark batch as sent"),
            }
        }

        info!(
            tenant = %tenant.name,
            sent = sent.len(),
            failed,
            cancelled,
            "batch reconciled"
        );

        Ok(())
    }

    /// One delivery attempt, folded into an explicit outcome.
    async fn attempt(
        &self,
        message: &OutboxMessage,
        shutdown: &CancellationToken,
    ) -> DeliveryOutcome {
        // Claims filter on the retry ceiling already; this guards against a
        // row claimed just before a concurrent failure recording pushed it
        // over.
        if message.retry_count >= self.config.max_retry_count as i64 {
            return DeliveryOutcome::TransientFailure("max retry count exceeded".to_owned());
        }

        let payload = match self.registry.decode(&message.payload_type, &message.payload) {
            Ok(payload) => payload,
            Err(e) => return DeliveryOutcome::PermanentFailure(e.to_string()),
        };

        let wire_id = Uuid::new_v4();

        let mut headers: HashMap<String, String> = message.headers.0.clone();
        headers.insert(MESSAGE_ID_HEADER.to_owned(), wire_id.to_string());

        let trace = message.trace_context();
        if let Some(trace) = &trace {
            trace.apply(&mut headers);
        }

        let envelope = OutboundEnvelope {
            message_id: wire_id,
            payload,
            destination: message.destination.clone(),
            headers,
        };

        // The span re-parents delivery onto the operation that produced the
        // message, using the context stored on the row.
        let span = info_span!(
            "deliver",
            id = message.id,
            kind = %message.kind,
            payload_type = %message.payload_type,
            trace_id = trace.as_ref().map(|t| t.trace_id()),
            parent_span_id = trace.as_ref().map(|t| t.span_id()),
        );

        let delivery = async {
            match message.kind {
                MessageKind::Command => self.commands.send(envelope).await,
                MessageKind::Notification => self.notifications.publish(envelope).await,
            }
        }
        .instrument(span);

        tokio::select! {
            _ = shutdown.cancelled() => DeliveryOutcome::Cancelled,
            result = delivery => match result {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(e) => e.into(),
            },
        }
    }

    /// Deletes sent rows past the retention window and applies the
    /// inactive-tenant policy.
    async fn retention_sweep(&self) -> Result<(), Error> {
        let mut conn = self.db.acquire().await?;

        let cutoff = Utc::now() - self.config.retention_window();
        let deleted = OutboxMessage::cleanup_sent(&mut conn, cutoff).await?;
        if deleted > 0 {
            info!(deleted, "cleaned up sent messages");
        }

        match self.config.inactive_tenant_policy {
            InactiveTenantPolicy::Hold => {}
            InactiveTenantPolicy::Flag => {
                for (tenant, backlog) in OutboxMessage::inactive_tenant_backlog(&mut conn).await? {
                    warn!(tenant = %tenant, backlog, "pending messages for inactive tenant");
                }
            }
            InactiveTenantPolicy::Purge => {
                let purged = OutboxMessage::purge_inactive_tenant_backlog(&mut conn).await?;
                if purged > 0 {
                    info!(purged, "purged backlog of inactive tenants");
                }
            }
        }

        Ok(())
    }
}
