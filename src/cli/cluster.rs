use clap::{Parser, ValueEnum};
use serde_json::json;

use crate::cli::{SubCommandExtend, connect_pipeline};
use crate::cluster::Outcome;
use crate::config::{CacheOptions, IndexOptions, Opts};

#[derive(Parser, Debug, Clone)]
pub struct ClusterCommand {
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub cache: CacheOptions,
    /// 单次外部调用的超时时间，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: u64,
    /// 图片引用
    pub reference: String,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for ClusterCommand {
    async fn run(&self, _opts: &Opts) -> anyhow::Result<()> {
        let timeout = std::time::Duration::from_secs(self.timeout);
        let pipeline = connect_pipeline(&self.index, &self.cache, timeout).await?;

        let outcome = pipeline.process(&self.reference).await;
        print_outcome(&self.reference, &outcome, self.output_format)?;

        match outcome {
            Outcome::Failed(e) => Err(e.context(format!("failed to cluster {}", self.reference))),
            _ => Ok(()),
        }
    }
}

fn print_outcome(reference: &str, outcome: &Outcome, format: OutputFormat) -> anyhow::Result<()> {
    let cluster_id = outcome.cluster_id().map(|id| id.as_str());
    match format {
        OutputFormat::Json => {
            let error = match outcome {
                Outcome::Failed(e) => Some(format!("{e:#}")),
                _ => None,
            };
            let value = json!({
                "reference": reference,
                "outcome": outcome.label(),
                "cluster_id": cluster_id,
                "error": error,
            });
            println!("{}", serde_json::to_string_pretty(&value)?)
        }
        OutputFormat::Table => {
            println!("{}\t{}\t{}", outcome.label(), cluster_id.unwrap_or("-"), reference);
        }
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}
