use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};

use super::CacheStore;

/// 内存缓存，记录每一次写入
#[derive(Default)]
pub struct MemoryCache {
    writes: Mutex<Vec<(String, String)>>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回键当前对应的值
    pub fn get(&self, key: &str) -> Option<String> {
        self.writes().into_iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// 按顺序返回全部写入记录
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.writes().into_iter().collect()
    }

    /// 模拟服务不可用
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl CacheStore for MemoryCache {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("缓存不可用");
        }
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("缓存不可用");
        }
        Ok(())
    }
}
