use std::sync::LazyLock;
use std::time::Duration;

use log::error;
use prometheus::*;
use tokio::task::spawn_blocking;
use tokio::time::sleep;

use crate::cluster::Outcome;
use crate::config::MetricsOptions;

static METRIC_PROCESSED_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "imcluster_processed_count",
        "count of the processed image references",
        &["outcome"]
    )
    .unwrap()
});

static METRIC_PROCESS_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "imcluster_process_duration",
        "duration of the per-image pipeline in seconds",
        &["outcome"]
    )
    .unwrap()
});

static METRIC_RECEIVE_ERROR_COUNT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("imcluster_receive_error_count", "count of the failed queue receives")
        .unwrap()
});

static METRIC_WORKER_RESTART_COUNT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("imcluster_worker_restart_count", "count of the restarted workers")
        .unwrap()
});

/// 记录一次处理结果及耗时
pub fn observe_outcome(outcome: &Outcome, duration: Duration) {
    let label = outcome.label();
    METRIC_PROCESSED_COUNT.with_label_values(&[label]).inc();
    METRIC_PROCESS_DURATION.with_label_values(&[label]).observe(duration.as_secs_f64());
}

pub fn inc_receive_error() {
    METRIC_RECEIVE_ERROR_COUNT.inc();
}

pub fn inc_worker_restart() {
    METRIC_WORKER_RESTART_COUNT.inc();
}

/// 按配置定期推送指标到 Pushgateway，未配置推送地址时不做任何事
pub fn spawn_pusher(opts: &MetricsOptions, instance: String) {
    let Some(url) = opts.prometheus_push.clone() else {
        return;
    };
    let auth = opts.prometheus_auth.clone();

    tokio::spawn(async move {
        loop {
            let metric_families = prometheus::gather();
            let url = url.clone();
            let instance = instance.clone();
            let auth = auth.clone();
            let r = spawn_blocking(move || {
                prometheus::push_metrics(
                    "imcluster",
                    labels! {
                        "instance".to_string() => instance,
                    },
                    &url,
                    metric_families,
                    auth.map(|(username, password)| BasicAuthentication { username, password }),
                )
            })
            .await;
            match r {
                Ok(Err(e)) => error!("推送指标失败: {e}"),
                Err(e) => error!("推送指标任务异常: {e}"),
                Ok(Ok(())) => {}
            }
            sleep(Duration::from_secs(30)).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_is_counted_by_label() {
        let before = METRIC_PROCESSED_COUNT.with_label_values(&["exists"]).get();
        observe_outcome(&Outcome::AlreadyExists, Duration::from_millis(3));
        let after = METRIC_PROCESSED_COUNT.with_label_values(&["exists"]).get();
        assert!(after > before);
    }
}
