mod assigner;
mod dedup;
mod pipeline;

use std::fmt;

pub use assigner::*;
pub use dedup::*;
pub use pipeline::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 聚类 ID，同一聚类中的图片互为（近似）重复
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// 生成一个新的随机聚类 ID
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ClusterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClusterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 单张图片的处理结果
#[derive(Debug)]
pub enum Outcome {
    /// 图片已写入索引，并分配到指定聚类
    Inserted(ClusterId),
    /// 图片此前已处理过，未做任何写入
    AlreadyExists,
    /// 处理失败
    Failed(anyhow::Error),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Inserted(_) => "inserted",
            Self::AlreadyExists => "exists",
            Self::Failed(_) => "failed",
        }
    }

    pub fn cluster_id(&self) -> Option<&ClusterId> {
        match self {
            Self::Inserted(cluster_id) => Some(cluster_id),
            _ => None,
        }
    }
}
