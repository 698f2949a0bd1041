use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use log::{error, info};

use super::{ClusterAssigner, ClusterId, Deduplicator, Outcome};
use crate::cache::{CacheStore, cache_key};
use crate::index::{Metadata, SimilarityIndex};
use crate::metrics;
use crate::utils::with_timeout;

/// 处理一张图片最多发起的外部调用次数
pub const CALLS_PER_MESSAGE: u32 = 4;

/// 单张图片的聚类流程：去重、投票、写入索引、写入缓存
pub struct ImageClusteringPipeline<I, C> {
    index: I,
    cache: C,
    dedup: Deduplicator,
    assigner: ClusterAssigner,
    timeout: Duration,
}

impl<I: SimilarityIndex, C: CacheStore> ImageClusteringPipeline<I, C> {
    pub fn new(index: I, cache: C, dedup: Deduplicator, assigner: ClusterAssigner) -> Self {
        Self { index, cache, dedup, assigner, timeout: Duration::from_secs(30) }
    }

    /// 设置每次外部调用的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 处理一张图片，任何错误都转换为 [`Outcome::Failed`]
    pub async fn process(&self, reference: &str) -> Outcome {
        let start = Instant::now();
        let outcome = match self.try_process(reference).await {
            Ok(Some(cluster_id)) => Outcome::Inserted(cluster_id),
            Ok(None) => Outcome::AlreadyExists,
            Err(e) => {
                error!("{}: 处理失败: {:#}", reference, e);
                Outcome::Failed(e)
            }
        };
        metrics::observe_outcome(&outcome, start.elapsed());
        outcome
    }

    /// 图片已存在时返回 None
    async fn try_process(&self, reference: &str) -> Result<Option<ClusterId>> {
        if reference.trim().is_empty() {
            bail!("图片引用为空");
        }

        let exists =
            with_timeout(self.timeout, "去重查询", self.dedup.exists(&self.index, reference)).await?;
        if exists {
            info!("{}: 已存在，跳过", reference);
            return Ok(None);
        }

        let candidates = with_timeout(
            self.timeout,
            "近似重复查询",
            self.assigner.near_duplicates(&self.index, reference),
        )
        .await?;
        let cluster_id = self.assigner.assign(&candidates);

        let metadata = Metadata::new(cluster_id.clone());
        with_timeout(self.timeout, "写入索引", self.index.add(reference, &metadata)).await?;
        info!("{}: 已写入索引，聚类 ID: {}", reference, cluster_id);

        // 索引已写入，缓存失败时整体仍视为失败
        with_timeout(
            self.timeout,
            "写入缓存",
            self.cache.set(&cache_key(reference), cluster_id.as_str()),
        )
        .await?;

        Ok(Some(cluster_id))
    }
}
