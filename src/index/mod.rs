mod http;
mod memory;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
pub use http::*;
pub use memory::*;
use serde::{Deserialize, Deserializer, Serialize};

use crate::cluster::ClusterId;

/// 随图片一起存入索引的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// 旧版本写入的字段名为 `clusterid`
    #[serde(alias = "clusterid")]
    pub cluster_id: ClusterId,
}

impl Metadata {
    pub fn new(cluster_id: ClusterId) -> Self {
        Self { cluster_id }
    }
}

/// 一条搜索结果
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Hit {
    /// 图片引用
    #[serde(rename = "path")]
    pub reference: String,
    /// 与查询图片的签名距离
    #[serde(rename = "dist", default)]
    pub distance: f32,
    /// 没有元数据或元数据中缺少聚类 ID 时为 None
    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: Option<Metadata>,
}

/// 外部相似度索引服务
///
/// 签名的计算与检索都由服务端完成，这里只约定查询与写入接口
pub trait SimilarityIndex: Send + Sync {
    /// 搜索签名距离不超过 `distance_threshold` 的图片，结果按相似度从高到低排列
    fn search_near_duplicates(
        &self,
        reference: &str,
        distance_threshold: f32,
    ) -> impl Future<Output = Result<Vec<Hit>>> + Send;

    /// 添加一张图片及其元数据
    fn add(&self, reference: &str, metadata: &Metadata) -> impl Future<Output = Result<()>> + Send;

    /// 检查服务是否可用
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;
}

impl<T: SimilarityIndex> SimilarityIndex for Arc<T> {
    fn search_near_duplicates(
        &self,
        reference: &str,
        distance_threshold: f32,
    ) -> impl Future<Output = Result<Vec<Hit>>> + Send {
        (**self).search_near_duplicates(reference, distance_threshold)
    }

    fn add(&self, reference: &str, metadata: &Metadata) -> impl Future<Output = Result<()>> + Send {
        (**self).add(reference, metadata)
    }

    fn ping(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).ping()
    }
}

fn lenient_metadata<'de, D>(deserializer: D) -> Result<Option<Metadata>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}
