//! 走 HTTP API 直连 block engine 的 bundle 投递器。
//! 提交后先轮询 in-flight 状态，Landed 再做终局确认。

use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::confirm::{self, ConfirmOutcome};

use super::error::LanderError;
use super::stack::Deadline;

pub const BUNDLE_POLL_ATTEMPTS: usize = 10;
pub const BUNDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 已处理过的 bundle 在重复提交时拿不到新 id，用占位符返回。
pub const PLACEHOLDER_BUNDLE_ID: &str = "0x0";

const ALREADY_PROCESSED_MARKER: &str = "already processed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightStatus {
    Pending,
    Landed,
    Failed,
    Invalid,
}

impl InflightStatus {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(Self::Pending),
            "Landed" => Some(Self::Landed),
            "Failed" => Some(Self::Failed),
            "Invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct BlockEngineRelay {
    client: reqwest::Client,
    endpoint: String,
}

impl BlockEngineRelay {
    pub fn new(client: reqwest::Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 提交 bundle 并跟踪到终态。`tentative_bundle_id` 是上一通道
    /// 留下的 id，重复提交被拒时兜底返回它。
    pub async fn submit(
        &self,
        wire_transactions: &[Vec<u8>],
        tentative_bundle_id: Option<String>,
        deadline: Deadline,
    ) -> Result<String, LanderError> {
        if deadline.expired() {
            return Err(LanderError::fatal(
                "deadline expired before bundle submission",
            ));
        }

        let encoded: Vec<String> = wire_transactions
            .iter()
            .map(|bytes| bs58::encode(bytes).into_string())
            .collect();
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendBundle",
            "params": [encoded],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let value: Value = response.json().await?;

        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown bundle error")
                .to_string();
            // bundle 已被引擎收下，重复提交是幂等成功。
            if message.contains(ALREADY_PROCESSED_MARKER) {
                let bundle_id =
                    tentative_bundle_id.unwrap_or_else(|| PLACEHOLDER_BUNDLE_ID.to_string());
                debug!(
                    target: "lander::block_engine",
                    bundle_id,
                    "bundle 已被处理，按幂等成功返回"
                );
                return Ok(bundle_id);
            }
            return Err(LanderError::bundle(message, tentative_bundle_id));
        }

        let bundle_id = value
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| LanderError::bundle("sendBundle 响应缺少 result", None))?;

        self.track_inflight(&bundle_id).await?;
        Ok(bundle_id)
    }

    async fn track_inflight(&self, bundle_id: &str) -> Result<(), LanderError> {
        for attempt in 0..BUNDLE_POLL_ATTEMPTS {
            match self.fetch_inflight_status(bundle_id).await {
                Ok(Some(InflightStatus::Landed)) => {
                    return match confirm::confirm_bundle(&self.client, &self.endpoint, bundle_id)
                        .await
                    {
                        ConfirmOutcome::Failed(message) => {
                            Err(LanderError::bundle(message, Some(bundle_id.to_string())))
                        }
                        _ => Ok(()),
                    };
                }
                Ok(Some(InflightStatus::Failed)) => {
                    return Err(LanderError::bundle(
                        "bundle 被引擎标记为 Failed",
                        Some(bundle_id.to_string()),
                    ));
                }
                // Invalid 表示尚未进入系统视野，继续等。
                Ok(Some(InflightStatus::Pending) | Some(InflightStatus::Invalid)) | Ok(None) => {}
                Err(err) => {
                    warn!(
                        target: "lander::block_engine",
                        bundle_id,
                        attempt,
                        error = %err,
                        "查询 in-flight 状态失败，继续轮询"
                    );
                }
            }

            if attempt + 1 < BUNDLE_POLL_ATTEMPTS {
                sleep(BUNDLE_POLL_INTERVAL).await;
            }
        }

        Err(LanderError::BundleUnresolved {
            bundle_id: bundle_id.to_string(),
        })
    }

    async fn fetch_inflight_status(
        &self,
        bundle_id: &str,
    ) -> Result<Option<InflightStatus>, LanderError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getInflightBundleStatuses",
            "params": [[bundle_id]],
        });
        let value: Value = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let status = value
            .pointer("/result/value/0/status")
            .and_then(Value::as_str)
            .and_then(InflightStatus::parse);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::time::Instant;

    fn deadline() -> Deadline {
        Deadline::from_instant(Instant::now() + Duration::from_secs(30))
    }

    fn relay_for(url: &str) -> BlockEngineRelay {
        BlockEngineRelay::new(reqwest::Client::new(), url.to_string())
    }

    fn inflight_body(bundle_id: &str, status: &str) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "context": { "slot": 1000 },
                "value": [{ "bundle_id": bundle_id, "status": status, "landed_slot": 999 }]
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn landed_bundle_returns_engine_id() {
        let mut server = mockito::Server::new_async().await;
        let _send = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJsonString(r#"{"method":"sendBundle"}"#.into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "jsonrpc": "2.0", "id": 1, "result": "bundle-1" }).to_string())
            .create_async()
            .await;
        let _inflight = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJsonString(
                r#"{"method":"getInflightBundleStatuses"}"#.into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(inflight_body("bundle-1", "Landed"))
            .create_async()
            .await;
        let _confirm = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJsonString(
                r#"{"method":"getBundleStatuses"}"#.into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "context": { "slot": 1000 },
                        "value": [{
                            "bundle_id": "bundle-1",
                            "transactions": [],
                            "slot": 999,
                            "confirmation_status": "confirmed",
                            "err": { "Ok": null },
                        }]
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let relay = relay_for(&server.url());
        let bundle_id = relay
            .submit(&[vec![1, 2, 3]], None, deadline())
            .await
            .expect("submit");
        assert_eq!(bundle_id, "bundle-1");
    }

    #[tokio::test]
    async fn already_processed_is_idempotent_success() {
        let mut server = mockito::Server::new_async().await;
        let _send = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": { "code": -32602, "message": "bundle already processed" }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let relay = relay_for(&server.url());
        let carried = relay
            .submit(&[vec![1]], Some("earlier-id".into()), deadline())
            .await
            .expect("idempotent");
        assert_eq!(carried, "earlier-id");

        let placeholder = relay
            .submit(&[vec![1]], None, deadline())
            .await
            .expect("placeholder");
        assert_eq!(placeholder, PLACEHOLDER_BUNDLE_ID);
    }

    #[tokio::test]
    async fn rejection_carries_tentative_id() {
        let mut server = mockito::Server::new_async().await;
        let _send = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": { "code": -32000, "message": "bundle rejected: low tip" }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let relay = relay_for(&server.url());
        let err = relay
            .submit(&[vec![1]], Some("tentative".into()), deadline())
            .await
            .unwrap_err();
        assert!(err.is_bundle_specific());
        assert_eq!(err.bundle_id(), Some("tentative"));
    }
}
