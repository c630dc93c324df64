//! 经内部代理路由提交 bundle。代理在服务端持有 gRPC 连接，
//! 这里只负责一跳 HTTP 与尽力而为的确认。

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::confirm::{self, ConfirmOutcome};

use super::error::LanderError;
use super::stack::Deadline;

#[derive(Clone)]
pub struct ProxyRelay {
    client: reqwest::Client,
    endpoint: String,
    /// bundle 状态查询走的端点，通常是 block engine 本体。
    status_endpoint: String,
}

impl ProxyRelay {
    pub fn new(client: reqwest::Client, endpoint: String, status_endpoint: String) -> Self {
        Self {
            client,
            endpoint,
            status_endpoint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn submit(
        &self,
        wire_transactions: &[Vec<u8>],
        deadline: Deadline,
    ) -> Result<String, LanderError> {
        if deadline.expired() {
            return Err(LanderError::fatal(
                "deadline expired before relay submission",
            ));
        }

        let encoded: Vec<String> = wire_transactions
            .iter()
            .map(|bytes| bs58::encode(bytes).into_string())
            .collect();
        let payload = json!({ "transactions": encoded });

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
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string());
            return Err(LanderError::bundle(message, None));
        }

        let bundle_id = value
            .get("bundleId")
            .or_else(|| value.get("result"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| LanderError::bundle("relay 响应缺少 bundleId", None))?;

        info!(
            target: "lander::relay",
            bundle_id,
            endpoint = %self.endpoint,
            "bundle 已递交代理"
        );

        // 确认无结论不算失败，明确的 Failed 才带着 id 降级。
        match confirm::confirm_bundle(&self.client, &self.status_endpoint, &bundle_id).await {
            ConfirmOutcome::Failed(message) => Err(LanderError::bundle(message, Some(bundle_id))),
            outcome => {
                debug!(
                    target: "lander::relay",
                    bundle_id,
                    outcome = ?outcome,
                    "relay bundle 确认结束"
                );
                Ok(bundle_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn deadline() -> Deadline {
        Deadline::from_instant(Instant::now() + Duration::from_secs(30))
    }

    #[tokio::test]
    async fn submit_returns_bundle_id_despite_unresolved_confirm() {
        let mut server = mockito::Server::new_async().await;
        let _send = server
            .mock("POST", "/bundles")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "bundleId": "relay-7" }).to_string())
            .create_async()
            .await;
        // 状态端点查不到 bundle，确认无结论。
        let _status = server
            .mock("POST", "/status")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": { "context": { "slot": 1 }, "value": [{
                        "bundle_id": "relay-7",
                        "transactions": [],
                        "slot": 1,
                        "confirmation_status": "finalized",
                        "err": { "Ok": null },
                    }] }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let relay = ProxyRelay::new(
            reqwest::Client::new(),
            format!("{}/bundles", server.url()),
            format!("{}/status", server.url()),
        );
        let bundle_id = relay
            .submit(&[vec![9, 9]], deadline())
            .await
            .expect("submit");
        assert_eq!(bundle_id, "relay-7");
    }

    #[tokio::test]
    async fn relay_error_field_is_bundle_failure() {
        let mut server = mockito::Server::new_async().await;
        let _send = server
            .mock("POST", "/bundles")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "error": "relay unavailable" }).to_string())
            .create_async()
            .await;

        let relay = ProxyRelay::new(
            reqwest::Client::new(),
            format!("{}/bundles", server.url()),
            server.url(),
        );
        let err = relay.submit(&[vec![1]], deadline()).await.unwrap_err();
        assert!(err.is_bundle_specific());
    }
}
