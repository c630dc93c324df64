//! 投递前模拟。单笔走类型化客户端，多笔合并为一次 JSON-RPC
//! batch POST，可用独立的模拟端点分流读放大。

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use solana_client::client_error::ClientError;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSimulateTransactionConfig;
use solana_client::rpc_request::RpcRequest;
use solana_client::rpc_response::RpcSimulateTransactionResult;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::transaction::{TransactionError, VersionedTransaction};
use thiserror::Error;
use tracing::debug;

use crate::tx::CompiledTransaction;

#[derive(Debug, Error)]
pub enum SimulateError {
    #[error("交易 {index} 模拟未通过: {message}")]
    Logical {
        index: usize,
        message: String,
        logs: Vec<String>,
        /// 指令级错误时定位到的出错程序。
        program_id: Option<Pubkey>,
    },
    #[error("模拟请求失败: {0}")]
    Rpc(#[from] ClientError),
    #[error("模拟请求网络错误: {0}")]
    Network(#[from] reqwest::Error),
    #[error("模拟响应解析失败: {0}")]
    Parse(String),
}

/// 单笔交易的模拟结果摘要。
#[derive(Debug, Clone, Default)]
pub struct SimulationOutcome {
    pub err: Option<TransactionError>,
    pub logs: Vec<String>,
    pub units_consumed: Option<u64>,
}

struct SimulateFlags {
    sig_verify: bool,
    replace_recent_blockhash: bool,
    min_context_slot: Option<u64>,
}

pub struct Simulator {
    rpc: Arc<RpcClient>,
    http: reqwest::Client,
    commitment: CommitmentConfig,
    /// 指定后批量模拟请求改投该端点。
    override_endpoint: Option<String>,
}

impl Simulator {
    pub fn new(
        rpc: Arc<RpcClient>,
        http: reqwest::Client,
        commitment: CommitmentConfig,
        override_endpoint: Option<String>,
    ) -> Self {
        Self {
            rpc,
            http,
            commitment,
            override_endpoint,
        }
    }

    /// 硬闸门：任一交易模拟报错即整批终止，日志原样带回。
    pub async fn gate(
        &self,
        transactions: &[CompiledTransaction],
        min_context_slot: u64,
    ) -> Result<Vec<SimulationOutcome>, SimulateError> {
        let outcomes = self
            .simulate_batch(
                transactions,
                SimulateFlags {
                    sig_verify: false,
                    replace_recent_blockhash: false,
                    min_context_slot: Some(min_context_slot),
                },
            )
            .await?;

        for (index, (outcome, tx)) in outcomes.iter().zip(transactions).enumerate() {
            if let Some(err) = &outcome.err {
                return Err(SimulateError::Logical {
                    index,
                    message: err.to_string(),
                    logs: outcome.logs.clone(),
                    program_id: failing_program_id(&tx.transaction, err),
                });
            }
        }
        Ok(outcomes)
    }

    /// 预估消耗单位，失败整体吞掉，缺失项回退默认预算。
    pub async fn estimate_units(
        &self,
        transactions: &[CompiledTransaction],
    ) -> Vec<Option<u64>> {
        let result = self
            .simulate_batch(
                transactions,
                SimulateFlags {
                    sig_verify: false,
                    replace_recent_blockhash: true,
                    min_context_slot: None,
                },
            )
            .await;

        match result {
            Ok(outcomes) => outcomes
                .into_iter()
                .map(|outcome| {
                    if outcome.err.is_some() {
                        None
                    } else {
                        outcome.units_consumed
                    }
                })
                .collect(),
            Err(err) => {
                debug!(target: "simulate", error = %err, "预估模拟失败，使用默认预算");
                vec![None; transactions.len()]
            }
        }
    }

    async fn simulate_batch(
        &self,
        transactions: &[CompiledTransaction],
        flags: SimulateFlags,
    ) -> Result<Vec<SimulationOutcome>, SimulateError> {
        if transactions.is_empty() {
            return Ok(Vec::new());
        }

        if transactions.len() == 1 && self.override_endpoint.is_none() {
            let config = RpcSimulateTransactionConfig {
                sig_verify: flags.sig_verify,
                replace_recent_blockhash: flags.replace_recent_blockhash,
                commitment: Some(self.commitment),
                min_context_slot: flags.min_context_slot,
                ..Default::default()
            };
            let response = self
                .rpc
                .simulate_transaction_with_config(&transactions[0].transaction, config)
                .await?;
            return Ok(vec![outcome_from_result(response.value)]);
        }

        self.simulate_raw_batch(transactions, &flags).await
    }

    async fn simulate_raw_batch(
        &self,
        transactions: &[CompiledTransaction],
        flags: &SimulateFlags,
    ) -> Result<Vec<SimulationOutcome>, SimulateError> {
        let endpoint = self
            .override_endpoint
            .clone()
            .unwrap_or_else(|| self.rpc.url());

        let mut payload = Vec::with_capacity(transactions.len());
        let mut id_to_index = HashMap::with_capacity(transactions.len());
        for (index, tx) in transactions.iter().enumerate() {
            let id = index as u64 + 1;
            id_to_index.insert(id, index);
            let mut config = json!({
                "encoding": "base64",
                "sigVerify": flags.sig_verify,
                "replaceRecentBlockhash": flags.replace_recent_blockhash,
                "commitment": self.commitment.commitment,
            });
            if let Some(slot) = flags.min_context_slot {
                config["minContextSlot"] = json!(slot);
            }
            let params = json!([BASE64.encode(&tx.wire_bytes), config]);
            payload.push(RpcRequest::SimulateTransaction.build_request_json(id, params));
        }

        let raw: Value = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let entries = raw
            .as_array()
            .ok_or_else(|| SimulateError::Parse("batch 响应必须是数组".into()))?;

        let mut outcomes = vec![SimulationOutcome::default(); transactions.len()];
        for entry in entries {
            let id = entry
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| SimulateError::Parse("batch 响应缺少 id".into()))?;
            let index = *id_to_index
                .get(&id)
                .ok_or_else(|| SimulateError::Parse(format!("未知的响应 id {id}")))?;

            if let Some(error) = entry.get("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown rpc error");
                return Err(SimulateError::Parse(format!(
                    "交易 {index} 模拟请求被拒: {message}"
                )));
            }

            let value = entry
                .get("result")
                .and_then(|result| result.get("value"))
                .cloned()
                .ok_or_else(|| SimulateError::Parse("batch 响应缺少 result.value".into()))?;
            let parsed: RpcSimulateTransactionResult = serde_json::from_value(value)
                .map_err(|err| SimulateError::Parse(err.to_string()))?;
            outcomes[index] = outcome_from_result(parsed);
        }

        Ok(outcomes)
    }
}

fn outcome_from_result(result: RpcSimulateTransactionResult) -> SimulationOutcome {
    SimulationOutcome {
        err: result.err.map(Into::into),
        logs: result.logs.unwrap_or_default(),
        units_consumed: result.units_consumed,
    }
}

/// 指令级错误按指令下标反查程序账户，其余错误无从归因。
fn failing_program_id(tx: &VersionedTransaction, err: &TransactionError) -> Option<Pubkey> {
    let TransactionError::InstructionError(ix_index, _) = err else {
        return None;
    };
    let message = &tx.message;
    let ix = message.instructions().get(*ix_index as usize)?;
    message
        .static_account_keys()
        .get(ix.program_id_index as usize)
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::hash::Hash;
    use solana_sdk::instruction::{AccountMeta, Instruction};
    use solana_sdk::message::VersionedMessage;
    use solana_sdk::message::v0::Message as V0Message;
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::signature::Keypair;
    use solana_sdk::signer::Signer;
    use solana_sdk::transaction::VersionedTransaction;

    fn compiled_tx() -> CompiledTransaction {
        let payer = Keypair::new();
        let ix = Instruction {
            program_id: Pubkey::new_unique(),
            accounts: vec![AccountMeta::new(payer.pubkey(), true)],
            data: vec![1, 2, 3],
        };
        let message =
            V0Message::try_compile(&payer.pubkey(), &[ix], &[], Hash::default()).unwrap();
        let transaction =
            VersionedTransaction::try_new(VersionedMessage::V0(message), &[&payer]).unwrap();
        let wire_bytes =
            bincode::serde::encode_to_vec(&transaction, bincode::config::standard()).unwrap();
        CompiledTransaction {
            serialized_size: wire_bytes.len(),
            transaction,
            wire_bytes,
        }
    }

    fn simulator_for(url: &str) -> Simulator {
        Simulator::new(
            Arc::new(RpcClient::new(url.to_string())),
            reqwest::Client::new(),
            CommitmentConfig::confirmed(),
            Some(url.to_string()),
        )
    }

    fn batch_entry(id: u64, err: Value, logs: Value, units: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "context": { "slot": 1000 },
                "value": {
                    "err": err,
                    "logs": logs,
                    "accounts": null,
                    "unitsConsumed": units,
                    "returnData": null,
                }
            }
        })
    }

    #[tokio::test]
    async fn gate_passes_clean_batch() {
        let mut server = mockito::Server::new_async().await;
        let body = json!([
            batch_entry(1, Value::Null, json!(["ok"]), json!(5_000)),
            batch_entry(2, Value::Null, json!([]), json!(7_000)),
        ]);
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let sim = simulator_for(&server.url());
        let txs = vec![compiled_tx(), compiled_tx()];
        let outcomes = sim.gate(&txs, 100).await.expect("gate");
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].units_consumed, Some(5_000));
        assert_eq!(outcomes[1].units_consumed, Some(7_000));
    }

    #[tokio::test]
    async fn gate_surfaces_program_logs() {
        let mut server = mockito::Server::new_async().await;
        let body = json!([
            batch_entry(1, Value::Null, json!([]), json!(1_000)),
            batch_entry(
                2,
                json!({"InstructionError": [0, {"Custom": 6001}]}),
                json!(["Program log: insufficient funds"]),
                Value::Null
            ),
        ]);
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let sim = simulator_for(&server.url());
        let txs = vec![compiled_tx(), compiled_tx()];
        let failing_message = &txs[1].transaction.message;
        let expected_program = failing_message.static_account_keys()
            [failing_message.instructions()[0].program_id_index as usize];

        let err = sim.gate(&txs, 100).await.unwrap_err();
        match err {
            SimulateError::Logical {
                index,
                logs,
                program_id,
                ..
            } => {
                assert_eq!(index, 1);
                assert_eq!(logs, vec!["Program log: insufficient funds".to_string()]);
                assert_eq!(program_id, Some(expected_program));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn estimate_swallows_transport_failures() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(500)
            .create_async()
            .await;

        let sim = simulator_for(&server.url());
        let txs = vec![compiled_tx(), compiled_tx()];
        let units = sim.estimate_units(&txs).await;
        assert_eq!(units, vec![None, None]);
    }

    #[tokio::test]
    async fn estimate_skips_failing_transactions() {
        let mut server = mockito::Server::new_async().await;
        let body = json!([
            batch_entry(1, Value::Null, json!([]), json!(42_000)),
            batch_entry(2, json!("BlockhashNotFound"), json!([]), json!(0)),
        ]);
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let sim = simulator_for(&server.url());
        let txs = vec![compiled_tx(), compiled_tx()];
        let units = sim.estimate_units(&txs).await;
        assert_eq!(units, vec![Some(42_000), None]);
    }
}
