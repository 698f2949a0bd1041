use anyhow::Result;
use log::debug;

use crate::index::SimilarityIndex;

/// 判断图片是否已经处理过
///
/// 只检查排名第一的结果，同一张图片以其他引用入库并排在前面时会返回 false，
/// 此时图片会被重复处理。
#[derive(Debug, Clone)]
pub struct Deduplicator {
    exact_threshold: f32,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Deduplicator {
    pub fn new(exact_threshold: f32) -> Self {
        Self { exact_threshold }
    }

    pub async fn exists<I: SimilarityIndex>(&self, index: &I, reference: &str) -> Result<bool> {
        let hits = index.search_near_duplicates(reference, self.exact_threshold).await?;
        let exists = hits.first().is_some_and(|hit| hit.reference == reference);
        debug!("{} 是否已存在: {}", reference, exists);
        Ok(exists)
    }
}
