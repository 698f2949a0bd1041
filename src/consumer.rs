use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::cache::CacheStore;
use crate::cluster::{ImageClusteringPipeline, Outcome};
use crate::config::ConsumerOptions;
use crate::index::SimilarityIndex;
use crate::metrics;
use crate::queue::MessageQueue;
use crate::utils::with_timeout;

/// 队列消费者的运行参数
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub wait_time: Duration,
    /// 队列为空或接收失败后的休眠时间
    pub empty_backoff: Duration,
    /// 处理完一批消息后的休眠时间
    pub busy_backoff: Duration,
    pub timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            wait_time: Duration::from_secs(20),
            empty_backoff: Duration::from_secs(5),
            busy_backoff: Duration::ZERO,
            timeout: Duration::from_secs(30),
        }
    }
}

impl From<&ConsumerOptions> for ConsumerConfig {
    fn from(opts: &ConsumerOptions) -> Self {
        Self {
            batch_size: opts.batch_size as usize,
            wait_time: Duration::from_secs(opts.wait_time),
            empty_backoff: Duration::from_millis(opts.empty_backoff),
            busy_backoff: Duration::from_millis(opts.busy_backoff),
            timeout: opts.timeout(),
        }
    }
}

/// 一次轮询的统计结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub inserted: usize,
    pub existed: usize,
    pub failed: usize,
    /// 租约已被其他 worker 接管而跳过的消息
    pub skipped: usize,
    /// 下一次轮询前需要休眠的时间
    pub backoff: Duration,
}

/// 从队列接收图片引用并逐条处理
///
/// 无论处理结果如何，消息都会被删除，失败的消息只记录日志，不会重试。
pub struct QueueConsumer<Q, I, C> {
    id: usize,
    queue: Q,
    pipeline: ImageClusteringPipeline<I, C>,
    config: ConsumerConfig,
}

impl<Q, I, C> QueueConsumer<Q, I, C>
where
    Q: MessageQueue,
    I: SimilarityIndex,
    C: CacheStore,
{
    pub fn new(
        id: usize,
        queue: Q,
        pipeline: ImageClusteringPipeline<I, C>,
        config: ConsumerConfig,
    ) -> Self {
        Self { id, queue, pipeline, config }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// 持续消费，不会返回
    pub async fn run(&self) {
        info!("worker {}: 开始消费队列", self.id);
        loop {
            let report = self.poll_once().await;
            if !report.backoff.is_zero() {
                sleep(report.backoff).await;
            }
        }
    }

    /// 接收并处理一批消息
    pub async fn poll_once(&self) -> BatchReport {
        // 接收本身最多等待 wait_time，额外留出一次调用的超时
        let limit = self.config.wait_time + self.config.timeout;
        let received = with_timeout(
            limit,
            "接收消息",
            self.queue.receive(self.config.batch_size, self.config.wait_time),
        )
        .await;

        let messages = match received {
            Ok(messages) => messages,
            Err(e) => {
                error!("worker {}: 接收消息失败: {:#}", self.id, e);
                metrics::inc_receive_error();
                return BatchReport { backoff: self.config.empty_backoff, ..Default::default() };
            }
        };

        if messages.is_empty() {
            debug!("worker {}: 队列为空", self.id);
            return BatchReport { backoff: self.config.empty_backoff, ..Default::default() };
        }

        let mut report = BatchReport {
            received: messages.len(),
            backoff: self.config.busy_backoff,
            ..Default::default()
        };
        for message in &messages {
            // 处理前续租，已失效说明消息已被重新投递给其他 worker
            let extended = with_timeout(
                self.config.timeout,
                "续租消息",
                self.queue.extend(&message.ack_handle),
            )
            .await;
            if let Err(e) = extended {
                warn!("worker {}: 跳过消息 {}: {:#}", self.id, message.ack_handle.id, e);
                report.skipped += 1;
                continue;
            }

            match self.pipeline.process(&message.body).await {
                Outcome::Inserted(cluster_id) => {
                    info!("worker {}: {} -> {}", self.id, message.body, cluster_id);
                    report.inserted += 1;
                }
                Outcome::AlreadyExists => report.existed += 1,
                Outcome::Failed(_) => report.failed += 1,
            }

            let deleted = with_timeout(
                self.config.timeout,
                "删除消息",
                self.queue.delete(&message.ack_handle),
            )
            .await;
            if let Err(e) = deleted {
                warn!("worker {}: 删除消息 {} 失败: {:#}", self.id, message.ack_handle.id, e);
            }
        }

        info!(
            "worker {}: 本批 {} 条，新增 {}，已存在 {}，失败 {}，跳过 {}",
            self.id, report.received, report.inserted, report.existed, report.failed, report.skipped
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::cluster::{ClusterAssigner, Deduplicator};
    use anyhow::Result;
    use tokio::time::Instant;

    use crate::index::{Hit, MemoryIndex, Metadata};
    use crate::queue::{AckHandle, MemoryQueue, Message};

    type TestConsumer = QueueConsumer<Arc<MemoryQueue>, Arc<MemoryIndex>, Arc<MemoryCache>>;

    struct Fixture {
        queue: Arc<MemoryQueue>,
        index: Arc<MemoryIndex>,
        cache: Arc<MemoryCache>,
        consumer: TestConsumer,
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            batch_size: 10,
            wait_time: Duration::from_secs(1),
            empty_backoff: Duration::from_secs(5),
            busy_backoff: Duration::from_millis(100),
            timeout: Duration::from_secs(3),
        }
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let index = Arc::new(MemoryIndex::new());
        let cache = Arc::new(MemoryCache::new());
        let pipeline = ImageClusteringPipeline::new(
            index.clone(),
            cache.clone(),
            Deduplicator::default(),
            ClusterAssigner::new(0.1),
        );
        let consumer = QueueConsumer::new(1, queue.clone(), pipeline, config());
        Fixture { queue, index, cache, consumer }
    }

    /// 记录每次接收的开始与结束时间
    struct RecordingQueue {
        inner: MemoryQueue,
        receives: std::sync::Mutex<Vec<(Instant, Instant)>>,
    }

    impl RecordingQueue {
        fn new() -> Self {
            Self { inner: MemoryQueue::new(Duration::from_secs(60)), receives: Default::default() }
        }

        fn receives(&self) -> Vec<(Instant, Instant)> {
            self.receives.lock().unwrap().clone()
        }
    }

    impl MessageQueue for RecordingQueue {
        async fn receive(&self, max_batch: usize, wait_time: Duration) -> Result<Vec<Message>> {
            let start = Instant::now();
            let messages = self.inner.receive(max_batch, wait_time).await;
            self.receives.lock().unwrap().push((start, Instant::now()));
            messages
        }

        async fn delete(&self, handle: &AckHandle) -> Result<()> {
            self.inner.delete(handle).await
        }

        async fn extend(&self, handle: &AckHandle) -> Result<()> {
            self.inner.extend(handle).await
        }

        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_sleeps_empty_interval_between_empty_receives() {
        let queue = Arc::new(RecordingQueue::new());
        let pipeline = ImageClusteringPipeline::new(
            Arc::new(MemoryIndex::new()),
            Arc::new(MemoryCache::new()),
            Deduplicator::default(),
            ClusterAssigner::new(0.1),
        );
        let consumer = QueueConsumer::new(1, queue.clone(), pipeline, config());

        let _ = tokio::time::timeout(Duration::from_secs(20), consumer.run()).await;

        let receives = queue.receives();
        assert_eq!(receives.len(), 4);
        for pair in receives.windows(2) {
            let (_, prev_end) = pair[0];
            let (next_start, _) = pair[1];
            assert_eq!(next_start - prev_end, Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_sleeps_busy_interval_after_batch() {
        let queue = Arc::new(RecordingQueue::new());
        queue.inner.push("img-1");
        let pipeline = ImageClusteringPipeline::new(
            Arc::new(MemoryIndex::new()),
            Arc::new(MemoryCache::new()),
            Deduplicator::default(),
            ClusterAssigner::new(0.1),
        );
        let consumer = QueueConsumer::new(1, queue.clone(), pipeline, config());

        let _ = tokio::time::timeout(Duration::from_secs(3), consumer.run()).await;

        let receives = queue.receives();
        let (_, first_end) = receives[0];
        let (second_start, _) = receives[1];
        assert_eq!(second_start - first_end, Duration::from_millis(100));
        assert!(queue.inner.is_empty());
    }

    /// 每次搜索耗时 20 秒的索引
    #[derive(Clone)]
    struct SlowIndex(Arc<MemoryIndex>);

    impl SimilarityIndex for SlowIndex {
        async fn search_near_duplicates(&self, reference: &str, threshold: f32) -> Result<Vec<Hit>> {
            sleep(Duration::from_secs(20)).await;
            self.0.search_near_duplicates(reference, threshold).await
        }

        async fn add(&self, reference: &str, metadata: &Metadata) -> Result<()> {
            self.0.add(reference, metadata).await
        }

        async fn ping(&self) -> Result<()> {
            self.0.ping().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_batch_does_not_process_redelivered_messages_twice() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(300)));
        let index = SlowIndex(Arc::new(MemoryIndex::new()));
        let cache = Arc::new(MemoryCache::new());
        for i in 0..10 {
            queue.push(&format!("img-{i}"));
        }

        let consumer = |id| {
            let pipeline = ImageClusteringPipeline::new(
                index.clone(),
                cache.clone(),
                Deduplicator::default(),
                ClusterAssigner::new(0.1),
            );
            QueueConsumer::new(id, queue.clone(), pipeline, ConsumerConfig::default())
        };
        let a = consumer(1);
        let b = consumer(2);

        // 每条消息约 40 秒，b 在 a 的原始租约过期后开始接收
        let (report_a, report_b) = tokio::join!(a.poll_once(), async {
            sleep(Duration::from_secs(301)).await;
            b.poll_once().await
        });

        assert_eq!(report_a.received, 10);
        assert_eq!(report_b.received, 2);
        assert_eq!(report_a.skipped, 2);
        assert_eq!(report_a.inserted + report_b.inserted, 10);
        for i in 0..10 {
            assert_eq!(index.0.records_of(&format!("img-{i}")).len(), 1);
        }
        assert!(queue.is_empty());
        assert_eq!(cache.writes().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_batch_uses_busy_interval() {
        let f = fixture();
        f.queue.push("img-1");
        f.queue.push("img-2");
        f.queue.push("img-1");

        let report = f.consumer.poll_once().await;
        assert_eq!(
            report,
            BatchReport {
                received: 3,
                inserted: 2,
                existed: 1,
                failed: 0,
                skipped: 0,
                backoff: Duration::from_millis(100),
            }
        );
        assert!(f.queue.is_empty());
        assert_eq!(f.index.len(), 2);
        assert_eq!(f.cache.writes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_messages_are_still_deleted() {
        let f = fixture();
        f.queue.push("img-1");
        f.queue.push("");
        f.index.set_unavailable(true);

        let report = f.consumer.poll_once().await;
        assert_eq!(report.failed, 2);
        assert!(f.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn receive_failure_backs_off() {
        let f = fixture();
        f.queue.push("img-1");
        f.queue.set_unavailable(true);

        let report = f.consumer.poll_once().await;
        assert_eq!(report, BatchReport { backoff: Duration::from_secs(5), ..Default::default() });

        // 队列恢复后继续处理
        f.queue.set_unavailable(false);
        let report = f.consumer.poll_once().await;
        assert_eq!(report.inserted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_queue() {
        let f = fixture();
        for i in 0..25 {
            f.queue.push(&format!("img-{i}"));
        }
        let _ = tokio::time::timeout(Duration::from_secs(30), f.consumer.run()).await;
        assert!(f.queue.is_empty());
        assert_eq!(f.index.len(), 25);
    }
}
