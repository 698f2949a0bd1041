use std::process::exit;

use clap::Parser;
use imcluster::Opts;
use imcluster::cli::SubCommandExtend;
use imcluster::config::SubCommand;

#[tokio::main]
async fn main() {
    env_logger::init();

    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        // 参数错误统一以 1 退出
        Err(e) if e.use_stderr() => {
            e.print().ok();
            exit(1);
        }
        Err(e) => e.exit(),
    };

    let result = match &opts.subcmd {
        SubCommand::Run(cmd) => cmd.run(&opts).await,
        SubCommand::Worker(cmd) => cmd.run(&opts).await,
        SubCommand::Enqueue(cmd) => cmd.run(&opts).await,
        SubCommand::Cluster(cmd) => cmd.run(&opts).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e:?}");
        exit(1);
    }
}
