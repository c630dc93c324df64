//! tip floor 行情缓存。后台轮询 REST 端点，提交路径上
//! 只读原子值，不等网络。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::{AbortHandle, Abortable, Aborted};
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::tx::fees::sol_to_lamports;

use super::error::LanderError;

pub const DEFAULT_TIP_FLOOR_REFRESH: Duration = Duration::from_millis(5_000);
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(200);

/// tip floor 参考档位。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipFloorLevel {
    P50,
    P75,
    P95,
    Ema50,
}

impl TipFloorLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TipFloorLevel::P50 => "p50",
            TipFloorLevel::P75 => "p75",
            TipFloorLevel::P95 => "p95",
            TipFloorLevel::Ema50 => "ema50",
        }
    }
}

/// 端点返回的单条行情，数值单位是 SOL。
#[derive(Debug, Deserialize, Default, Clone)]
pub struct TipFloorSnapshot {
    pub landed_tips_25th_percentile: Option<f64>,
    pub landed_tips_50th_percentile: Option<f64>,
    pub landed_tips_75th_percentile: Option<f64>,
    pub landed_tips_95th_percentile: Option<f64>,
    pub landed_tips_99th_percentile: Option<f64>,
    pub ema_landed_tips_50th_percentile: Option<f64>,
}

impl TipFloorSnapshot {
    pub fn level_ui(&self, level: TipFloorLevel) -> Option<f64> {
        match level {
            TipFloorLevel::P50 => self.landed_tips_50th_percentile,
            TipFloorLevel::P75 => self.landed_tips_75th_percentile,
            TipFloorLevel::P95 => self.landed_tips_95th_percentile,
            TipFloorLevel::Ema50 => self.ema_landed_tips_50th_percentile,
        }
    }
}

/// 行情只抬高静态 tip，不压低，最后套全局上限。
pub fn effective_tip_ui(static_tip_ui: f64, floor_ui: Option<f64>, max_tip_ui: f64) -> f64 {
    let mut tip = static_tip_ui;
    if let Some(floor) = floor_ui {
        if floor > tip {
            tip = floor;
        }
    }
    if max_tip_ui > 0.0 && tip > max_tip_ui {
        tip = max_tip_ui;
    }
    tip
}

/// 拉一次行情，给 CLI 展示用。
pub async fn fetch_tip_floor_once(
    client: &reqwest::Client,
    endpoint: &str,
) -> Result<TipFloorSnapshot, LanderError> {
    let entries: Vec<TipFloorSnapshot> = client
        .get(endpoint)
        .header("accept", "application/json")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    entries
        .into_iter()
        .next()
        .ok_or_else(|| LanderError::fatal("tip floor 端点返回空数组"))
}

pub struct TipFloorCache {
    shared: Arc<TipFloorShared>,
    task: Arc<TipFloorTask>,
}

impl TipFloorCache {
    pub fn spawn(
        client: reqwest::Client,
        endpoint: String,
        level: TipFloorLevel,
        refresh: Duration,
    ) -> Self {
        let shared = Arc::new(TipFloorShared {
            latest_lamports: AtomicU64::new(0),
            client,
            endpoint,
            level,
            refresh: refresh.max(MIN_REFRESH_INTERVAL),
        });

        let task = if let Ok(handle) = Handle::try_current() {
            let shared_clone = shared.clone();
            let (abort_handle, abort_registration) = AbortHandle::new_pair();
            let abortable = Abortable::new(
                async move { shared_clone.run().await },
                abort_registration,
            );
            handle.spawn(async move {
                if let Err(Aborted) = abortable.await {
                    debug!(target: "lander::tipfloor", "tip floor 轮询任务被显式中止");
                }
            });
            TipFloorTask {
                abort: Some(abort_handle),
            }
        } else {
            warn!(
                target: "lander::tipfloor",
                "未检测到 Tokio runtime，tip floor 轮询未启动"
            );
            TipFloorTask { abort: None }
        };

        Self {
            shared,
            task: Arc::new(task),
        }
    }

    /// 最近一次成功拉取的 floor，单位 lamports。
    pub fn latest_lamports(&self) -> Option<u64> {
        let value = self.shared.latest_lamports.load(Ordering::Relaxed);
        if value > 0 { Some(value) } else { None }
    }

    pub fn latest_ui(&self) -> Option<f64> {
        self.latest_lamports()
            .map(|lamports| lamports as f64 / 1_000_000_000.0)
    }
}

impl Clone for TipFloorCache {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            task: self.task.clone(),
        }
    }
}

impl Drop for TipFloorCache {
    fn drop(&mut self) {
        if Arc::strong_count(&self.task) == 1 {
            self.task.abort();
        }
    }
}

struct TipFloorTask {
    abort: Option<AbortHandle>,
}

impl TipFloorTask {
    fn abort(&self) {
        if let Some(handle) = &self.abort {
            handle.abort();
        }
    }
}

struct TipFloorShared {
    latest_lamports: AtomicU64,
    client: reqwest::Client,
    endpoint: String,
    level: TipFloorLevel,
    refresh: Duration,
}

impl TipFloorShared {
    async fn run(self: Arc<Self>) {
        loop {
            match fetch_tip_floor_once(&self.client, &self.endpoint).await {
                Ok(snapshot) => {
                    if let Some(ui) = snapshot.level_ui(self.level) {
                        let lamports = sol_to_lamports(ui);
                        if lamports > 0 {
                            self.latest_lamports.store(lamports, Ordering::Relaxed);
                            crate::monitoring::events::tip_floor_update(
                                self.level.as_str(),
                                lamports,
                            );
                        }
                    } else {
                        debug!(
                            target: "lander::tipfloor",
                            level = self.level.as_str(),
                            "行情缺少所选档位，沿用旧值"
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        target: "lander::tipfloor",
                        endpoint = %self.endpoint,
                        error = %err,
                        "tip floor 拉取失败，将在 {:?} 后重试",
                        self.refresh
                    );
                }
            }

            sleep(self.refresh).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_level_selection() {
        let snapshot = TipFloorSnapshot {
            landed_tips_50th_percentile: Some(0.000_01),
            landed_tips_75th_percentile: Some(0.000_05),
            landed_tips_95th_percentile: Some(0.000_2),
            ema_landed_tips_50th_percentile: Some(0.000_02),
            ..Default::default()
        };
        assert_eq!(snapshot.level_ui(TipFloorLevel::P75), Some(0.000_05));
        assert_eq!(snapshot.level_ui(TipFloorLevel::Ema50), Some(0.000_02));
    }

    #[test]
    fn effective_tip_only_raises() {
        // 行情低于静态值时不压低。
        assert_eq!(effective_tip_ui(0.001, Some(0.0001), 0.01), 0.001);
        // 行情更高则抬到行情。
        assert_eq!(effective_tip_ui(0.001, Some(0.005), 0.01), 0.005);
        // 上限兜底。
        assert_eq!(effective_tip_ui(0.001, Some(0.5), 0.01), 0.01);
        // 无行情时维持静态值。
        assert_eq!(effective_tip_ui(0.002, None, 0.01), 0.002);
    }

    #[tokio::test]
    async fn fetch_once_parses_first_entry() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v1/bundles/tip_floor")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!([{
                    "time": "2024-01-01T00:00:00Z",
                    "landed_tips_25th_percentile": 0.000001,
                    "landed_tips_50th_percentile": 0.00001,
                    "landed_tips_75th_percentile": 0.00005,
                    "landed_tips_95th_percentile": 0.0002,
                    "landed_tips_99th_percentile": 0.001,
                    "ema_landed_tips_50th_percentile": 0.00002,
                }])
                .to_string(),
            )
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let snapshot = fetch_tip_floor_once(
            &client,
            &format!("{}/api/v1/bundles/tip_floor", server.url()),
        )
        .await
        .expect("fetch");
        assert_eq!(snapshot.landed_tips_75th_percentile, Some(0.00005));
    }
}
