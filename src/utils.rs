use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow};
use indicatif::ProgressStyle;

/// 为外部调用加上超时，超时视为普通错误
pub async fn with_timeout<T, F>(duration: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{} 超时（{:?}）", what, duration)),
    }
}

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}
