#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

//! Durable event and cursor storage.
//!
//! Two tables per database: `events`, keyed by
//! `<tx hash>:<log index>`, and `chain_state`, one row per chain holding
//! the listener cursor. Reorged events are status-flipped, never deleted.

use std::cmp::Ordering;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::{Migrate, MigrateDatabase, Migrator};
use sqlx::pool::PoolOptions;
use sqlx::postgres::PgRow;
use sqlx::{Executor, Pool, Postgres, Row};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::chain_id::ChainId;
use crate::config::DatabaseConfig;
use crate::event::{ConfirmationClass, Event, EventId, EventKind, EventStatus};

pub mod memory;

// Statically link in migration files
static MIGRATOR: Migrator = sqlx::migrate!("schemas/database");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was created.
    Inserted,
    /// The event existed as `Reorged` and was reset to pending at its
    /// newly observed block.
    Revived,
    /// The event already exists; nothing changed.
    Exists,
}

impl InsertOutcome {
    /// Whether the event was novel, in the sense the listener logs.
    #[must_use]
    pub const fn stored(&self) -> bool {
        matches!(self, Self::Inserted)
    }
}

/// The persistence operations the pipeline depends on. Implemented by the
/// Postgres [`Database`] and by [`memory::MemoryStore`] for tests and dry
/// runs.
#[async_trait]
pub trait ChainStore: Send + Sync {
    async fn insert_event_if_not_exists(&self, event: &Event) -> Result<InsertOutcome, StoreError>;

    async fn get_event(&self, id: &EventId) -> Result<Option<Event>, StoreError>;

    async fn list_by_status(
        &self,
        chain: ChainId,
        statuses: &[EventStatus],
    ) -> Result<Vec<Event>, StoreError>;

    async fn list_confirmed(&self, chain: ChainId) -> Result<Vec<Event>, StoreError>;

    /// Persist mutated status / confirmations / block height of an
    /// existing event.
    async fn update_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Monotonic: stores `max(current, height)`.
    async fn update_chain_height(&self, chain: ChainId, height: u64) -> Result<(), StoreError>;

    /// Returns 0 when no cursor has been stored yet.
    async fn get_chain_height(&self, chain: ChainId) -> Result<u64, StoreError>;
}

pub struct Database {
    pub pool: Pool<Postgres>,
}

impl Database {
    #[instrument(skip_all)]
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        info!(url = %&config.database, "Connecting to database");

        // Create database if requested and does not exist
        if config.migrate && !Postgres::database_exists(config.database.expose().as_str()).await? {
            warn!(url = %&config.database, "Database does not exist, creating database");
            Postgres::create_database(config.database.expose().as_str()).await?;
        }

        let pool = PoolOptions::<Postgres>::new()
            .max_connections(config.max_connections)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    conn.execute("SET DEFAULT_TRANSACTION_ISOLATION TO 'SERIALIZABLE'")
                        .await?;
                    Ok(())
                })
            })
            .connect(config.database.expose().as_str())
            .await
            .context("error connecting to database")?;

        let version = pool
            .fetch_one("SELECT version()")
            .await
            .context("error getting database version")?
            .get::<String, _>(0);
        info!(url = %&config.database, ?version, "Connected to database");

        let latest = MIGRATOR
            .migrations
            .last()
            .expect("Missing migrations")
            .version;

        if config.migrate {
            info!(url = %&config.database, "Running migrations");
            MIGRATOR.run(&pool).await?;
        }

        // Validate database schema version
        let mut conn = pool.acquire().await?;

        if conn.dirty_version().await?.is_some() {
            error!(
                url = %&config.database,
                expected = latest,
                "Database is in incomplete migration state.",
            );
            return Err(anyhow!("Database is in incomplete migration state."));
        }

        let version = conn
            .list_applied_migrations()
            .await?
            .last()
            .expect("Missing migrations")
            .version;

        match version.cmp(&latest) {
            Ordering::Less => {
                error!(
                    url = %&config.database,
                    version,
                    expected = latest,
                    "Database is not up to date, try rerunning with database.migrate",
                );
                return Err(anyhow!(
                    "Database is not up to date, try rerunning with database.migrate"
                ));
            }
            Ordering::Greater => {
                error!(
                    url = %&config.database,
                    version,
                    latest,
                    "Database version is newer than this version of the software, please update.",
                );
                return Err(anyhow!(
                    "Database version is newer than this version of the software, please update."
                ));
            }
            Ordering::Equal => {
                info!(
                    url = %&config.database,
                    version,
                    latest,
                    "Database version is up to date.",
                );
            }
        }

        Ok(Self { pool })
    }
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let id: String = row.get("event_id");
    let corrupt = |reason: &str| StoreError::Corrupt {
        id: id.clone(),
        reason: reason.to_owned(),
    };

    let chain: String = row.get("chain_id");
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let class: String = row.get("confirmation_class");

    Ok(Event {
        id: EventId::parse(&id).map_err(|_| corrupt("bad event id"))?,
        chain: chain.parse().map_err(|_| corrupt("bad chain id"))?,
        block_height: row.get::<i64, _>("block_height") as u64,
        kind: EventKind::from_str(&kind).ok_or_else(|| corrupt("bad kind"))?,
        status: EventStatus::from_str(&status).ok_or_else(|| corrupt("bad status"))?,
        class: ConfirmationClass::from_str(&class).ok_or_else(|| corrupt("bad class"))?,
        confirmations: row.get::<i64, _>("confirmations") as u64,
        payload: row.get("payload"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        confirmed_at: row.get::<Option<DateTime<Utc>>, _>("confirmed_at"),
        voted_at: row.get::<Option<DateTime<Utc>>, _>("voted_at"),
    })
}

const EVENT_COLUMNS: &str = "event_id, chain_id, block_height, kind, status, confirmation_class, \
                             confirmations, payload, created_at, updated_at, confirmed_at, voted_at";

#[async_trait]
impl ChainStore for Database {
    #[instrument(skip_all, fields(event = %event.id), level = "debug")]
    async fn insert_event_if_not_exists(&self, event: &Event) -> Result<InsertOutcome, StoreError> {
        // A conflicting row is only touched when it was reorged: the event
        // has been observed again at a (possibly different) block and goes
        // back to pending. `xmax = 0` distinguishes a fresh insert from
        // that revival.
        let row = sqlx::query(
            r#"
            INSERT INTO events (event_id, chain_id, block_height, kind, status,
                                confirmation_class, confirmations, payload,
                                created_at, updated_at, confirmed_at, voted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (event_id) DO UPDATE
            SET block_height  = EXCLUDED.block_height,
                status        = 'pending_confirmation',
                confirmations = 0,
                updated_at    = EXCLUDED.updated_at
            WHERE events.status = 'reorged'
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(event.id.as_str())
        .bind(event.chain.to_string())
        .bind(event.block_height as i64)
        .bind(event.kind.as_str())
        .bind(event.status.as_str())
        .bind(event.class.as_str())
        .bind(event.confirmations as i64)
        .bind(&event.payload)
        .bind(event.created_at)
        .bind(event.updated_at)
        .bind(event.confirmed_at)
        .bind(event.voted_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            None => InsertOutcome::Exists,
            Some(row) if row.get::<bool, _>("inserted") => InsertOutcome::Inserted,
            Some(_) => InsertOutcome::Revived,
        })
    }

    async fn get_event(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE event_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn list_by_status(
        &self,
        chain: ChainId,
        statuses: &[EventStatus],
    ) -> Result<Vec<Event>, StoreError> {
        let statuses = statuses
            .iter()
            .map(|s| s.as_str().to_owned())
            .collect::<Vec<_>>();

        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE chain_id = $1 AND status = ANY($2) \
             ORDER BY block_height, event_id"
        ))
        .bind(chain.to_string())
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn list_confirmed(&self, chain: ChainId) -> Result<Vec<Event>, StoreError> {
        self.list_by_status(
            chain,
            &[EventStatus::FastConfirmed, EventStatus::StandardConfirmed],
        )
        .await
    }

    async fn update_event(&self, event: &Event) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE events
            SET block_height = $2, status = $3, confirmations = $4,
                updated_at = $5, confirmed_at = $6, voted_at = $7
            WHERE event_id = $1
            "#,
        )
        .bind(event.id.as_str())
        .bind(event.block_height as i64)
        .bind(event.status.as_str())
        .bind(event.confirmations as i64)
        .bind(event.updated_at)
        .bind(event.confirmed_at)
        .bind(event.voted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_chain_height(&self, chain: ChainId, height: u64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO chain_state (chain_id, last_block)
            VALUES ($1, $2)
            ON CONFLICT (chain_id) DO UPDATE
            SET last_block = GREATEST(chain_state.last_block, EXCLUDED.last_block)
            "#,
        )
        .bind(chain.to_string())
        .bind(height as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_chain_height(&self, chain: ChainId) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT last_block FROM chain_state WHERE chain_id = $1")
            .bind(chain.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map_or(0, |r| r.get::<i64, _>(0) as u64))
    }
}
