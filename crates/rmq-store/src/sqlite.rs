use async_trait::async_trait;
use rmq_common::{Clock, Message, MessageStatus, SystemClock};
use sqlx::{Pool, Row, Sqlite};
use std::sync::Arc;
use tracing::{debug, info};

use crate::durable::{MessageStore, StoredMessage};
use crate::{Result, StoreError};

/// SQLite-backed [`MessageStore`]
pub struct SqliteMessageStore {
    pool: Pool<Sqlite>,
    clock: Arc<dyn Clock>,
}

impl SqliteMessageStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp rows with `clock` instead of the system time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS redismq_messages (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                virtual_queue TEXT NOT NULL,
                msg_offset INTEGER NOT NULL,
                tag TEXT NOT NULL,
                msg_key TEXT,
                body TEXT NOT NULL,
                header TEXT NOT NULL,
                execute_time INTEGER NOT NULL,
                execute_scope INTEGER,
                status INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Replay reads by virtual queue and offset
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_redismq_vq_offset
            ON redismq_messages (virtual_queue, msg_offset)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_redismq_created
            ON redismq_messages (created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite message store schema initialized");
        Ok(())
    }

    async fn save_messages(&self, messages: &[Message]) -> Result<u64> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for message in messages {
            let row = StoredMessage::from_message(message, now)?;
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO redismq_messages
                    (id, queue, virtual_queue, msg_offset, tag, msg_key, body, header,
                     execute_time, execute_scope, status, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(&row.queue)
            .bind(&row.virtual_queue)
            .bind(row.offset)
            .bind(&row.tag)
            .bind(&row.key)
            .bind(&row.body)
            .bind(&row.header)
            .bind(row.execute_time)
            .bind(row.execute_scope)
            .bind(row.status.code())
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        debug!(batch = messages.len(), inserted, "Saved messages");
        Ok(inserted)
    }

    async fn update_status(&self, ids: &[String], status: MessageStatus) -> Result<u64> {
        let now = self.clock.now_millis();
        let mut updated = 0;
        for id in ids {
            let result = sqlx::query(
                "UPDATE redismq_messages SET status = ?, updated_at = ? WHERE id = ?",
            )
            .bind(status.code())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            updated += result.rows_affected();
        }
        Ok(updated)
    }

    async fn query_by_offset_range(
        &self,
        virtual_queue: &str,
        from_offset: i64,
        to_offset: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue, virtual_queue, msg_offset, tag, msg_key, body, header,
                   execute_time, execute_scope, status, created_at, updated_at
            FROM redismq_messages
            WHERE virtual_queue = ? AND msg_offset > ? AND msg_offset <= ?
            ORDER BY msg_offset
            LIMIT ?
            "#,
        )
        .bind(virtual_queue)
        .bind(from_offset)
        .bind(to_offset)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let code: i32 = row.get("status");
                let status = MessageStatus::from_code(code)
                    .ok_or_else(|| StoreError::Database(format!("unknown status code {code}")))?;
                Ok(StoredMessage {
                    id: row.get("id"),
                    queue: row.get("queue"),
                    virtual_queue: row.get("virtual_queue"),
                    offset: row.get("msg_offset"),
                    tag: row.get("tag"),
                    key: row.get("msg_key"),
                    body: row.get("body"),
                    header: row.get("header"),
                    execute_time: row.get("execute_time"),
                    execute_scope: row.get("execute_scope"),
                    status,
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                })
            })
            .collect()
    }

    async fn clear_expired(&self, before_millis: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM redismq_messages WHERE created_at < ?")
            .bind(before_millis)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
