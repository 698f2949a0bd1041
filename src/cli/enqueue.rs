use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use indicatif::ProgressBar;
use log::info;

use crate::cli::{SubCommandExtend, connect_queue};
use crate::config::{Opts, QueueOptions};
use crate::queue::parse_reference_line;
use crate::utils::pb_style;

/// 每个事务写入的消息数量
const CHUNK_SIZE: usize = 1000;

#[derive(Parser, Debug, Clone)]
pub struct EnqueueCommand {
    #[command(flatten)]
    pub queue: QueueOptions,
    /// 从文件读取图片引用，每行一条，`|` 之后的内容会被忽略
    #[arg(short, long, value_name = "FILE")]
    pub file: Option<PathBuf>,
    /// 图片引用
    pub references: Vec<String>,
}

impl EnqueueCommand {
    async fn collect(&self) -> anyhow::Result<Vec<String>> {
        let mut references = self
            .references
            .iter()
            .filter_map(|s| parse_reference_line(s))
            .map(str::to_string)
            .collect::<Vec<_>>();

        if let Some(file) = &self.file {
            let content = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            references.extend(content.lines().filter_map(parse_reference_line).map(str::to_string));
        }

        Ok(references)
    }
}

impl SubCommandExtend for EnqueueCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let references = self.collect().await?;
        if references.is_empty() {
            bail!("没有需要写入的图片引用");
        }

        let queue = connect_queue(&self.queue, &opts.conf_dir, Duration::from_secs(30)).await?;

        let pb = ProgressBar::new(references.len() as u64).with_style(pb_style());
        for chunk in references.chunks(CHUNK_SIZE) {
            queue.enqueue_batch(chunk).await?;
            pb.inc(chunk.len() as u64);
        }
        pb.finish_and_clear();

        info!("队列 {} 当前消息数量: {}", queue.name(), queue.len().await?);
        println!("enqueued {} references into {}", references.len(), queue.name());
        Ok(())
    }
}
