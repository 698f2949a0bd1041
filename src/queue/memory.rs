use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::time::{Instant, sleep};

use super::{AckHandle, Message, MessageQueue};

struct Entry {
    body: String,
    receipt: Option<String>,
    visible_at: Instant,
}

/// 内存消息队列，语义与 [`super::SqliteQueue`] 一致
pub struct MemoryQueue {
    messages: Mutex<BTreeMap<i64, Entry>>,
    next_id: AtomicI64,
    visibility_timeout: Duration,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            messages: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            visibility_timeout,
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn push(&self, body: &str) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = Entry { body: body.to_string(), receipt: None, visible_at: Instant::now() };
        self.lock().insert(id, entry);
        id
    }

    /// 尚未删除的消息数量
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 模拟服务不可用
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("消息队列不可用");
        }
        Ok(())
    }

    fn lease(&self, max_batch: usize) -> Vec<Message> {
        let now = Instant::now();
        let mut messages = self.lock();
        messages
            .iter_mut()
            .filter(|(_, entry)| entry.visible_at <= now)
            .take(max_batch)
            .map(|(id, entry)| {
                let receipt = format!("{}-{}", id, self.next_id.fetch_add(1, Ordering::SeqCst));
                entry.receipt = Some(receipt.clone());
                entry.visible_at = now + self.visibility_timeout;
                Message { body: entry.body.clone(), ack_handle: AckHandle { id: *id, receipt } }
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<i64, Entry>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MessageQueue for MemoryQueue {
    async fn receive(&self, max_batch: usize, wait_time: Duration) -> Result<Vec<Message>> {
        self.check_available()?;
        let messages = self.lease(max_batch);
        if !messages.is_empty() || wait_time.is_zero() {
            return Ok(messages);
        }
        sleep(wait_time).await;
        Ok(self.lease(max_batch))
    }

    async fn delete(&self, handle: &AckHandle) -> Result<()> {
        self.check_available()?;
        let mut messages = self.lock();
        match messages.get(&handle.id) {
            Some(entry) if entry.receipt.as_deref() == Some(handle.receipt.as_str()) => {
                messages.remove(&handle.id);
                Ok(())
            }
            _ => bail!("消息 {} 的租约已失效", handle.id),
        }
    }

    async fn extend(&self, handle: &AckHandle) -> Result<()> {
        self.check_available()?;
        let mut messages = self.lock();
        match messages.get_mut(&handle.id) {
            Some(entry) if entry.receipt.as_deref() == Some(handle.receipt.as_str()) => {
                entry.visible_at = Instant::now() + self.visibility_timeout;
                Ok(())
            }
            _ => bail!("消息 {} 的租约已失效", handle.id),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
