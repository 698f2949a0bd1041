mod memcached;
mod memory;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
pub use memcached::*;
pub use memory::*;

/// 外部键值缓存，仅用于加速按图片引用查询聚类 ID
pub trait CacheStore: Send + Sync {
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;

    /// 检查服务是否可用
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;
}

impl<T: CacheStore> CacheStore for Arc<T> {
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send {
        (**self).set(key, value)
    }

    fn ping(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).ping()
    }
}

/// 由图片引用计算缓存键（blake3 十六进制）
pub fn cache_key(reference: &str) -> String {
    blake3::hash(reference.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_stable_hex() {
        let key = cache_key("https://example.com/a.jpg");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, cache_key("https://example.com/a.jpg"));
        assert_ne!(key, cache_key("https://example.com/b.jpg"));
    }
}
