use std::sync::Arc;

use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use tracing::info;

use super::error::LanderError;
use super::stack::Deadline;

/// 直连 RPC 投递器。preflight、重试、minContextSlot 均由配置决定。
#[derive(Clone)]
pub struct RpcLander {
    client: Arc<RpcClient>,
    config: RpcSendTransactionConfig,
}

impl RpcLander {
    pub fn new(
        client: Arc<RpcClient>,
        skip_preflight: Option<bool>,
        max_retries: Option<usize>,
        min_context_slot: Option<u64>,
    ) -> Self {
        let mut config = RpcSendTransactionConfig::default();
        if let Some(skip) = skip_preflight {
            config.skip_preflight = skip;
        }
        if let Some(retries) = max_retries {
            config.max_retries = Some(retries);
        }
        if let Some(slot) = min_context_slot {
            config.min_context_slot = Some(slot);
        }

        Self { client, config }
    }

    pub async fn submit(
        &self,
        tx: &VersionedTransaction,
        deadline: Deadline,
    ) -> Result<Signature, LanderError> {
        if deadline.expired() {
            return Err(LanderError::fatal("deadline expired before rpc submission"));
        }

        let signature = self
            .client
            .send_transaction_with_config(tx, self.config.clone())
            .await?;
        info!(
            target: "lander::rpc",
            signature = %signature,
            endpoint = %self.client.url(),
            skip_preflight = self.config.skip_preflight,
            max_retries = ?self.config.max_retries,
            min_context_slot = ?self.config.min_context_slot,
            "transaction submitted via rpc client"
        );
        Ok(signature)
    }
}
