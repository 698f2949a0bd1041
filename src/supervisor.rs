use std::collections::BTreeMap;
use std::ffi::OsString;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use log::{error, info, warn};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Dead,
}

/// worker 的退出方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// 正常返回，同样需要重启
    Clean,
    Crashed(String),
}

/// 正在运行的 worker
pub trait WorkerHandle: Send {
    /// 用于日志的标识，例如任务序号或进程 ID
    fn label(&self) -> String;

    /// 检查 worker 是否已退出，不会阻塞
    fn check(&mut self) -> Option<WorkerExit>;

    /// 强制结束 worker
    fn kill(&mut self);
}

/// 按相同的配置启动 worker
pub trait WorkerLauncher {
    type Handle: WorkerHandle;

    fn launch(&self, id: usize) -> Result<Self::Handle>;
}

/// 以 tokio 任务运行的 worker
pub struct TaskLauncher<F> {
    factory: F,
    serial: AtomicU64,
}

impl<F, Fut> TaskLauncher<F>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(factory: F) -> Self {
        Self { factory, serial: AtomicU64::new(1) }
    }
}

pub struct TaskHandle {
    serial: u64,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    /// 每次启动递增的序号
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl<F, Fut> WorkerLauncher for TaskLauncher<F>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    type Handle = TaskHandle;

    fn launch(&self, id: usize) -> Result<TaskHandle> {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn((self.factory)(id));
        Ok(TaskHandle { serial, handle })
    }
}

impl WorkerHandle for TaskHandle {
    fn label(&self) -> String {
        format!("task #{}", self.serial)
    }

    fn check(&mut self) -> Option<WorkerExit> {
        if !self.handle.is_finished() {
            return None;
        }
        match (&mut self.handle).now_or_never()? {
            Ok(()) => Some(WorkerExit::Clean),
            Err(e) => Some(WorkerExit::Crashed(e.to_string())),
        }
    }

    fn kill(&mut self) {
        self.handle.abort();
    }
}

/// 以子进程运行的 worker，启动时追加 `--worker-id <id>` 参数
pub struct ProcessLauncher {
    program: OsString,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<OsString>,
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect() }
    }
}

pub struct ProcessHandle {
    child: Child,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Handle = ProcessHandle;

    fn launch(&self, id: usize) -> Result<ProcessHandle> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg("--worker-id")
            .arg(id.to_string())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn worker {id}"))?;
        Ok(ProcessHandle { child })
    }
}

impl WorkerHandle for ProcessHandle {
    fn label(&self) -> String {
        match self.child.id() {
            Some(pid) => format!("pid {pid}"),
            None => "exited process".to_string(),
        }
    }

    fn check(&mut self) -> Option<WorkerExit> {
        match self.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) if status.success() => Some(WorkerExit::Clean),
            Ok(Some(status)) => Some(WorkerExit::Crashed(status.to_string())),
            Err(e) => Some(WorkerExit::Crashed(e.to_string())),
        }
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!("结束子进程失败: {}", e);
        }
    }
}

/// 单个 worker 的状态，只由 [`WorkerSupervisor`] 修改
pub struct WorkerState<H> {
    id: usize,
    handle: Option<H>,
    status: WorkerStatus,
    restarts: u32,
}

impl<H> WorkerState<H> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

/// 维护固定数量的 worker，定期检查存活状态并重启已退出的 worker
pub struct WorkerSupervisor<L: WorkerLauncher> {
    launcher: L,
    interval: Duration,
    workers: BTreeMap<usize, WorkerState<L::Handle>>,
}

impl<L: WorkerLauncher> WorkerSupervisor<L> {
    pub fn new(launcher: L, interval: Duration) -> Self {
        Self { launcher, interval, workers: BTreeMap::new() }
    }

    /// 启动 `count` 个 worker，ID 从 1 开始
    pub fn start(&mut self, count: usize) -> Result<()> {
        for id in 1..=count {
            let handle = self.launcher.launch(id)?;
            info!("worker {} 已启动: {}", id, handle.label());
            let state =
                WorkerState { id, handle: Some(handle), status: WorkerStatus::Running, restarts: 0 };
            self.workers.insert(id, state);
        }
        Ok(())
    }

    /// 持续监控，不会返回
    pub async fn supervise(&mut self) {
        loop {
            sleep(self.interval).await;
            self.check_workers();
        }
    }

    /// 检查一次所有 worker，返回本次重启成功的数量
    pub fn check_workers(&mut self) -> usize {
        let mut restarted = 0;
        for state in self.workers.values_mut() {
            if state.status == WorkerStatus::Running {
                let exit = state.handle.as_mut().and_then(|handle| handle.check());
                match exit {
                    Some(WorkerExit::Clean) => {
                        error!("worker {} 意外退出", state.id);
                    }
                    Some(WorkerExit::Crashed(reason)) => {
                        error!("worker {} 已崩溃: {}", state.id, reason);
                    }
                    None => continue,
                }
                state.status = WorkerStatus::Dead;
                state.handle = None;
            }

            match self.launcher.launch(state.id) {
                Ok(handle) => {
                    info!("worker {} 已重启: {}", state.id, handle.label());
                    state.handle = Some(handle);
                    state.status = WorkerStatus::Running;
                    state.restarts += 1;
                    metrics::inc_worker_restart();
                    restarted += 1;
                }
                Err(e) => error!("worker {} 重启失败，等待下次检查: {:#}", state.id, e),
            }
        }
        restarted
    }

    /// 强制结束指定 worker，之后的检查会将其重启
    pub fn kill(&mut self, id: usize) -> bool {
        match self.workers.get_mut(&id).and_then(|state| state.handle.as_mut()) {
            Some(handle) => {
                handle.kill();
                true
            }
            None => false,
        }
    }

    pub fn worker(&self, id: usize) -> Option<&WorkerState<L::Handle>> {
        self.workers.get(&id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerState<L::Handle>> {
        self.workers.values()
    }

    /// 处于运行状态的 worker 数量
    pub fn running(&self) -> usize {
        self.workers.values().filter(|state| state.status == WorkerStatus::Running).count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use anyhow::bail;
    use futures::future::Pending;

    use super::*;

    fn pending_worker(_: usize) -> Pending<()> {
        futures::future::pending()
    }

    #[tokio::test(start_paused = true)]
    async fn killed_worker_is_replaced_after_one_check() {
        let interval = Duration::from_secs(300);
        let mut supervisor = WorkerSupervisor::new(TaskLauncher::new(pending_worker), interval);
        supervisor.start(4).unwrap();
        assert_eq!(supervisor.running(), 4);

        let old_serial = supervisor.worker(2).unwrap().handle().unwrap().serial();
        assert!(supervisor.kill(2));

        let _ = tokio::time::timeout(interval + Duration::from_secs(1), supervisor.supervise()).await;

        assert_eq!(supervisor.running(), 4);
        let worker = supervisor.worker(2).unwrap();
        assert_eq!(worker.status(), WorkerStatus::Running);
        assert_eq!(worker.restarts(), 1);
        assert_ne!(worker.handle().unwrap().serial(), old_serial);
        for id in [1, 3, 4] {
            assert_eq!(supervisor.worker(id).unwrap().restarts(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn clean_exit_is_restarted() {
        let mut supervisor =
            WorkerSupervisor::new(TaskLauncher::new(|_| async {}), Duration::from_secs(1));
        supervisor.start(3).unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(supervisor.check_workers(), 3);
        assert_eq!(supervisor.running(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_worker_is_restarted() {
        let launcher = TaskLauncher::new(|id| async move {
            if id == 1 {
                panic!("worker {id} panicked");
            }
            pending_worker(id).await
        });
        let mut supervisor = WorkerSupervisor::new(launcher, Duration::from_secs(1));
        supervisor.start(2).unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(supervisor.check_workers(), 1);
        assert_eq!(supervisor.worker(1).unwrap().restarts(), 1);
        assert_eq!(supervisor.worker(2).unwrap().restarts(), 0);
    }

    struct FlakyLauncher {
        inner: TaskLauncher<fn(usize) -> Pending<()>>,
        failing: Arc<AtomicBool>,
    }

    impl WorkerLauncher for FlakyLauncher {
        type Handle = TaskHandle;

        fn launch(&self, id: usize) -> Result<TaskHandle> {
            if self.failing.load(Ordering::SeqCst) {
                bail!("无法启动 worker {id}");
            }
            self.inner.launch(id)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_relaunch_is_retried() {
        let failing = Arc::new(AtomicBool::new(false));
        let launcher = FlakyLauncher {
            inner: TaskLauncher::new(pending_worker as fn(usize) -> Pending<()>),
            failing: failing.clone(),
        };
        let mut supervisor = WorkerSupervisor::new(launcher, Duration::from_secs(1));
        supervisor.start(2).unwrap();

        supervisor.kill(1);
        sleep(Duration::from_millis(10)).await;
        failing.store(true, Ordering::SeqCst);
        assert_eq!(supervisor.check_workers(), 0);
        assert_eq!(supervisor.worker(1).unwrap().status(), WorkerStatus::Dead);
        assert!(supervisor.worker(1).unwrap().handle().is_none());
        assert_eq!(supervisor.running(), 1);

        failing.store(false, Ordering::SeqCst);
        assert_eq!(supervisor.check_workers(), 1);
        assert_eq!(supervisor.running(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashed_process_is_restarted() {
        let launcher = ProcessLauncher::new("sh", ["-c", "exit 3"]);
        let mut supervisor = WorkerSupervisor::new(launcher, Duration::from_secs(1));
        supervisor.start(2).unwrap();
        sleep(Duration::from_millis(500)).await;

        assert_eq!(supervisor.check_workers(), 2);
        assert_eq!(supervisor.running(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn running_process_is_left_alone() {
        let launcher = ProcessLauncher::new("sh", ["-c", "sleep 30"]);
        let mut supervisor = WorkerSupervisor::new(launcher, Duration::from_secs(1));
        supervisor.start(1).unwrap();
        let pid = supervisor.worker(1).unwrap().handle().unwrap().pid();
        assert!(pid.is_some());

        assert_eq!(supervisor.check_workers(), 0);

        supervisor.kill(1);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(supervisor.check_workers(), 1);
        assert_ne!(supervisor.worker(1).unwrap().handle().unwrap().pid(), pid);
    }
}
