use anyhow::{Context, Result, anyhow, bail};
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::CacheStore;

/// memcached 允许的最大键长度
const MAX_KEY_LEN: usize = 250;

/// 使用 memcached 文本协议的缓存客户端
///
/// 连接在第一次请求时建立，出错后丢弃，下一次请求重新连接
pub struct MemcachedCache {
    addr: String,
    conn: Mutex<Option<BufStream<TcpStream>>>,
}

impl MemcachedCache {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), conn: Mutex::new(None) }
    }

    /// 发送一条命令并读取一行响应
    async fn command(&self, request: &[u8]) -> Result<String> {
        let mut guard = self.conn.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => {
                debug!("连接 memcached: {}", self.addr);
                let stream = TcpStream::connect(&self.addr)
                    .await
                    .with_context(|| format!("failed to connect memcached at {}", self.addr))?;
                BufStream::new(stream)
            }
        };

        let response = exchange(&mut stream, request).await?;
        *guard = Some(stream);
        Ok(response)
    }
}

async fn exchange(stream: &mut BufStream<TcpStream>, request: &[u8]) -> Result<String> {
    stream.write_all(request).await?;
    stream.flush().await?;

    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        bail!("memcached 关闭了连接");
    }
    Ok(line.trim_end().to_string())
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        bail!("memcached 键长度无效: {}", key.len());
    }
    if key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        bail!("memcached 键包含空白或控制字符: {:?}", key);
    }
    Ok(())
}

fn check_value(value: &str) -> Result<()> {
    if value.contains(['\r', '\n']) {
        bail!("memcached 值包含换行: {:?}", value);
    }
    Ok(())
}

impl CacheStore for MemcachedCache {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        check_key(key)?;
        check_value(value)?;
        let request = format!("set {} 0 0 {}\r\n{}\r\n", key, value.len(), value);
        match self.command(request.as_bytes()).await?.as_str() {
            "STORED" => Ok(()),
            other => Err(anyhow!("memcached set 失败: {}", other)),
        }
    }

    async fn ping(&self) -> Result<()> {
        let response = self.command(b"version\r\n").await?;
        if !response.starts_with("VERSION") {
            bail!("memcached 返回异常: {}", response);
        }
        Ok(())
    }
}
