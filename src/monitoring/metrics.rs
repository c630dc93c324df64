//! Prometheus 导出器装配。未安装时各事件只走 tracing，不产生计量开销。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use tracing::info;

static EXPORTER: OnceCell<()> = OnceCell::new();
static PROMETHEUS_ENABLED: AtomicBool = AtomicBool::new(false);

/// 安装 Prometheus 导出器并监听 listen 地址，重复调用是幂等的。
pub fn try_init_prometheus(listen: &str) -> Result<()> {
    EXPORTER
        .get_or_try_init(|| {
            let addr: SocketAddr = listen
                .parse()
                .with_context(|| format!("prometheus 监听地址无效: {listen}"))?;
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("prometheus 导出器安装失败")?;
            PROMETHEUS_ENABLED.store(true, Ordering::Relaxed);
            info!(target: "monitoring::metrics", %addr, "prometheus 导出器已启动");
            Ok(())
        })
        .map(|_| ())
}

/// 事件层据此决定是否真正打点。
pub fn prometheus_enabled() -> bool {
    PROMETHEUS_ENABLED.load(Ordering::Relaxed)
}
