use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use crate::cli::{SubCommandExtend, WorkerArgs};
use crate::config::{Isolation, Opts, SupervisorOptions};
use crate::metrics;
use crate::supervisor::{ProcessLauncher, TaskLauncher, WorkerLauncher, WorkerSupervisor};

#[derive(Parser, Debug, Clone)]
pub struct RunCommand {
    #[command(flatten)]
    pub worker: WorkerArgs,
    #[command(flatten)]
    pub supervisor: SupervisorOptions,
}

impl RunCommand {
    /// 子进程 worker 的启动参数，不含 `--worker-id`
    fn worker_process_args(&self, opts: &Opts, instance: &str) -> Vec<String> {
        let mut worker = self.worker.clone();
        worker.metrics.prometheus_instance = Some(instance.to_string());

        let mut args = vec![
            "--conf-dir".to_string(),
            opts.conf_dir.path().display().to_string(),
            "worker".to_string(),
        ];
        args.extend(worker.to_args());
        args
    }
}

impl SubCommandExtend for RunCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        // 启动前检查全部依赖，同时完成队列数据库迁移
        self.worker.connect(0, &opts.conf_dir).await.context("startup check failed")?;
        info!("依赖检查通过，队列: {}", self.worker.queue.queue);

        let instance = self.worker.metrics.instance();
        metrics::spawn_pusher(&self.worker.metrics, instance.clone());

        let count = self.supervisor.workers;
        let interval = self.supervisor.health_check_interval();
        match self.supervisor.isolation {
            Isolation::Task => {
                let args = self.worker.clone();
                let conf_dir = opts.conf_dir.clone();
                let launcher = TaskLauncher::new(move |id| {
                    let args = args.clone();
                    let conf_dir = conf_dir.clone();
                    async move {
                        match args.connect(id, &conf_dir).await {
                            Ok(consumer) => consumer.run().await,
                            Err(e) => error!("worker {}: 启动失败: {:#}", id, e),
                        }
                    }
                });
                supervise(launcher, count, interval).await
            }
            Isolation::Process => {
                let program =
                    std::env::current_exe().context("failed to locate current executable")?;
                let args = self.worker_process_args(opts, &instance);
                supervise(ProcessLauncher::new(program, args), count, interval).await
            }
        }
    }
}

async fn supervise<L: WorkerLauncher>(launcher: L, count: usize, interval: Duration) -> Result<()> {
    let mut supervisor = WorkerSupervisor::new(launcher, interval);
    supervisor.start(count)?;
    info!("已启动 {} 个 worker，存活检查间隔 {:?}", count, interval);
    supervisor.supervise().await;
    Ok(())
}
