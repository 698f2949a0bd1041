use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use log::{debug, info};
use rand::distr::{Alphanumeric, SampleString};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::time::{Instant, sleep};

use super::{AckHandle, Message, MessageQueue};

/// 队列为空时两次查询之间的间隔
const POLL_STEP: Duration = Duration::from_millis(200);

/// 基于 SQLite 的消息队列
///
/// 接收消息时为其设置不可见期限和租约凭据，只有持有凭据的消费者可以删除消息。
/// 超过期限仍未删除的消息会被重新投递。
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    queue: String,
    visibility_timeout: Duration,
}

impl SqliteQueue {
    /// 打开队列数据库，不存在时自动创建并执行迁移
    pub async fn open(url: &str, queue: &str, visibility_timeout: Duration) -> Result<Self> {
        info!("初始化队列数据库连接: {}", url);

        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid queue database url: {url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("failed to open queue database")?;

        debug!("检查数据库迁移");
        sqlx::migrate!().run(&pool).await.context("failed to migrate queue database")?;

        Ok(Self { pool, queue: queue.to_string(), visibility_timeout })
    }

    pub fn name(&self) -> &str {
        &self.queue
    }

    /// 添加一条消息，返回消息 ID
    pub async fn enqueue(&self, body: &str) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO message (queue, body, created_at)
            VALUES (?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&self.queue)
        .bind(body)
        .bind(now_millis())
        .fetch_one(&self.pool)
        .await?
        .try_get("id")?;
        Ok(id)
    }

    /// 在一个事务中批量添加消息
    pub async fn enqueue_batch<S: AsRef<str>>(&self, bodies: &[S]) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        for body in bodies {
            sqlx::query(
                r#"
                INSERT INTO message (queue, body, created_at)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(&self.queue)
            .bind(body.as_ref())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// 队列中尚未删除的消息数量
    pub async fn len(&self) -> Result<i64> {
        let count = sqlx::query("SELECT COUNT(*) AS count FROM message WHERE queue = ?")
            .bind(&self.queue)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        Ok(count)
    }

    /// 租用最多 `max_batch` 条当前可见的消息
    async fn lease(&self, max_batch: usize) -> Result<Vec<Message>> {
        let now = now_millis();
        let receipt = Alphanumeric.sample_string(&mut rand::rng(), 24);
        let visible_at = now + self.visibility_timeout.as_millis() as i64;

        let rows = sqlx::query(
            r#"
            UPDATE message
            SET receipt = ?, visible_at = ?, receive_count = receive_count + 1
            WHERE id IN (
                SELECT id FROM message
                WHERE queue = ? AND visible_at <= ?
                ORDER BY id ASC LIMIT ?
            )
            RETURNING id, body
            "#,
        )
        .bind(&receipt)
        .bind(visible_at)
        .bind(&self.queue)
        .bind(now)
        .bind(max_batch as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(|row| -> Result<Message> {
                Ok(Message {
                    body: row.try_get("body")?,
                    ack_handle: AckHandle { id: row.try_get("id")?, receipt: receipt.clone() },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        // RETURNING 不保证顺序
        messages.sort_by_key(|m| m.ack_handle.id);
        Ok(messages)
    }
}

impl MessageQueue for SqliteQueue {
    async fn receive(&self, max_batch: usize, wait_time: Duration) -> Result<Vec<Message>> {
        let deadline = Instant::now() + wait_time;
        loop {
            let messages = self.lease(max_batch).await?;
            let now = Instant::now();
            if !messages.is_empty() || now >= deadline {
                return Ok(messages);
            }
            sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn delete(&self, handle: &AckHandle) -> Result<()> {
        let result = sqlx::query("DELETE FROM message WHERE id = ? AND receipt = ?")
            .bind(handle.id)
            .bind(&handle.receipt)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("消息 {} 的租约已失效", handle.id);
        }
        Ok(())
    }

    async fn extend(&self, handle: &AckHandle) -> Result<()> {
        let visible_at = now_millis() + self.visibility_timeout.as_millis() as i64;
        let result = sqlx::query("UPDATE message SET visible_at = ? WHERE id = ? AND receipt = ?")
            .bind(visible_at)
            .bind(handle.id)
            .bind(&handle.receipt)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("消息 {} 的租约已失效", handle.id);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or_default()
}
