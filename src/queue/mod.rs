mod memory;
mod sqlite;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
pub use memory::*;
pub use sqlite::*;

/// 删除消息时需要提供的凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHandle {
    /// 消息 ID
    pub id: i64,
    /// 本次接收的租约凭据，消息被重新接收后旧凭据失效
    pub receipt: String,
}

/// 从队列中接收到的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: String,
    pub ack_handle: AckHandle,
}

/// 外部消息队列
pub trait MessageQueue: Send + Sync {
    /// 接收最多 `max_batch` 条消息，队列为空时最多等待 `wait_time`
    fn receive(
        &self,
        max_batch: usize,
        wait_time: Duration,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send;

    /// 确认并删除消息
    fn delete(&self, handle: &AckHandle) -> impl Future<Output = Result<()>> + Send;

    /// 将消息的不可见期限从现在起重新计算，租约已失效时返回错误
    fn extend(&self, handle: &AckHandle) -> impl Future<Output = Result<()>> + Send;

    /// 检查队列是否可用
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;
}

impl<T: MessageQueue> MessageQueue for Arc<T> {
    fn receive(
        &self,
        max_batch: usize,
        wait_time: Duration,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send {
        (**self).receive(max_batch, wait_time)
    }

    fn delete(&self, handle: &AckHandle) -> impl Future<Output = Result<()>> + Send {
        (**self).delete(handle)
    }

    fn extend(&self, handle: &AckHandle) -> impl Future<Output = Result<()>> + Send {
        (**self).extend(handle)
    }

    fn ping(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).ping()
    }
}

/// 从批量导入文件的一行中提取图片引用
///
/// 行格式为 `reference|其他字段`，只取第一个 `|` 之前的部分
pub fn parse_reference_line(line: &str) -> Option<&str> {
    let reference = line.split('|').next().unwrap_or_default().trim();
    if reference.is_empty() { None } else { Some(reference) }
}
