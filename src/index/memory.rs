use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};

use super::{Hit, Metadata, SimilarityIndex};

type DistanceFn = dyn Fn(&str, &str) -> f32 + Send + Sync;

/// 内存中的相似度索引，签名距离由外部传入的函数给出
pub struct MemoryIndex {
    records: Mutex<Vec<(String, Option<Metadata>)>>,
    distance: Box<DistanceFn>,
    unavailable: AtomicBool,
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndex {
    /// 创建只认可完全相同引用的索引
    pub fn new() -> Self {
        Self::with_distance(|a, b| if a == b { 0.0 } else { 1.0 })
    }

    pub fn with_distance<F>(distance: F) -> Self
    where
        F: Fn(&str, &str) -> f32 + Send + Sync + 'static,
    {
        Self {
            records: Mutex::new(vec![]),
            distance: Box::new(distance),
            unavailable: AtomicBool::new(false),
        }
    }

    /// 直接写入一条记录，元数据可以为空
    pub fn insert(&self, reference: &str, metadata: Option<Metadata>) {
        self.lock().push((reference.to_string(), metadata));
    }

    /// 返回某张图片的全部记录
    pub fn records_of(&self, reference: &str) -> Vec<Option<Metadata>> {
        self.lock().iter().filter(|(r, _)| r == reference).map(|(_, m)| m.clone()).collect()
    }

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
            bail!("相似度索引不可用");
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, Option<Metadata>)>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SimilarityIndex for MemoryIndex {
    async fn search_near_duplicates(
        &self,
        reference: &str,
        distance_threshold: f32,
    ) -> Result<Vec<Hit>> {
        self.check_available()?;
        let mut hits = self
            .lock()
            .iter()
            .map(|(r, metadata)| Hit {
                reference: r.clone(),
                distance: (self.distance)(reference, r),
                metadata: metadata.clone(),
            })
            .filter(|hit| hit.distance <= distance_threshold)
            .collect::<Vec<_>>();
        // 稳定排序，距离相同时按写入顺序
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(hits)
    }

    async fn add(&self, reference: &str, metadata: &Metadata) -> Result<()> {
        self.check_available()?;
        self.insert(reference, Some(metadata.clone()));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
