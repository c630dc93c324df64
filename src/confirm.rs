//! 落地确认。签名走 RPC 状态阶梯轮询，bundle 走中继的
//! getBundleStatuses，总时长 20 秒封顶。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::signature::Signature;
use tokio::time::{sleep, timeout};
use tracing::debug;

pub const CONFIRM_ATTEMPTS: usize = 8;
pub const CONFIRM_INTERVAL: Duration = Duration::from_secs(2);

pub const BUNDLE_CONFIRM_ATTEMPTS: usize = 5;
pub const BUNDLE_CONFIRM_INTERVAL: Duration = Duration::from_secs(2);
pub const BUNDLE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Landed,
    /// 区块高度越过 checkpoint 的有效期，交易不可能再落地。
    Expired,
    Failed(String),
    TimedOut,
}

pub struct Confirmer {
    rpc: Arc<RpcClient>,
    commitment: CommitmentConfig,
}

impl Confirmer {
    pub fn new(rpc: Arc<RpcClient>, commitment: CommitmentConfig) -> Self {
        Self { rpc, commitment }
    }

    /// 状态阶梯：轮询签名状态，期间的 RPC 抖动不终止轮询。
    pub async fn confirm_signature(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
    ) -> ConfirmOutcome {
        for attempt in 0..CONFIRM_ATTEMPTS {
            match self
                .rpc
                .get_signature_status_with_commitment(signature, self.commitment)
                .await
            {
                Ok(Some(Ok(()))) => return ConfirmOutcome::Landed,
                Ok(Some(Err(err))) => return ConfirmOutcome::Failed(err.to_string()),
                Ok(None) => {
                    if let Ok(height) = self.rpc.get_block_height().await {
                        if height > last_valid_block_height {
                            debug!(
                                target: "confirm",
                                signature = %signature,
                                height,
                                last_valid_block_height,
                                "blockhash 已过期"
                            );
                            return ConfirmOutcome::Expired;
                        }
                    }
                }
                Err(err) => {
                    debug!(
                        target: "confirm",
                        signature = %signature,
                        attempt,
                        error = %err,
                        "查询签名状态失败，继续轮询"
                    );
                }
            }

            if attempt + 1 < CONFIRM_ATTEMPTS {
                sleep(CONFIRM_INTERVAL).await;
            }
        }
        ConfirmOutcome::TimedOut
    }
}

/// 向中继查询 bundle 状态，轮询与总超时取先到者。
pub async fn confirm_bundle(
    http: &reqwest::Client,
    endpoint: &str,
    bundle_id: &str,
) -> ConfirmOutcome {
    match timeout(BUNDLE_CONFIRM_TIMEOUT, poll_bundle(http, endpoint, bundle_id)).await {
        Ok(outcome) => outcome,
        Err(_) => ConfirmOutcome::TimedOut,
    }
}

async fn poll_bundle(http: &reqwest::Client, endpoint: &str, bundle_id: &str) -> ConfirmOutcome {
    for attempt in 0..BUNDLE_CONFIRM_ATTEMPTS {
        match fetch_bundle_status(http, endpoint, bundle_id).await {
            Ok(Some(status)) => {
                if let Some(err) = status.err {
                    return ConfirmOutcome::Failed(err);
                }
                if matches!(
                    status.confirmation_status.as_deref(),
                    Some("confirmed") | Some("finalized")
                ) {
                    return ConfirmOutcome::Landed;
                }
            }
            Ok(None) => {}
            Err(err) => {
                debug!(
                    target: "confirm",
                    bundle_id,
                    attempt,
                    error = %err,
                    "查询 bundle 状态失败，继续轮询"
                );
            }
        }

        if attempt + 1 < BUNDLE_CONFIRM_ATTEMPTS {
            sleep(BUNDLE_CONFIRM_INTERVAL).await;
        }
    }
    ConfirmOutcome::TimedOut
}

struct BundleStatusEntry {
    confirmation_status: Option<String>,
    err: Option<String>,
}

async fn fetch_bundle_status(
    http: &reqwest::Client,
    endpoint: &str,
    bundle_id: &str,
) -> Result<Option<BundleStatusEntry>, reqwest::Error> {
    let payload = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "getBundleStatuses",
        "params": [[bundle_id]],
    });
    let raw: Value = http
        .post(endpoint)
        .json(&payload)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let Some(entry) = raw
        .pointer("/result/value/0")
        .filter(|value| !value.is_null())
    else {
        return Ok(None);
    };

    let confirmation_status = entry
        .get("confirmation_status")
        .and_then(Value::as_str)
        .map(str::to_owned);
    // err 形如 {"Ok": null} 表示成功，其余原样带回。
    let err = entry.get("err").and_then(|err| {
        if err.is_null() || err.get("Ok").is_some() {
            None
        } else {
            Some(err.to_string())
        }
    });

    Ok(Some(BundleStatusEntry {
        confirmation_status,
        err,
    }))
}
