//! 提交管线主体：注入、编译、模拟、投递、确认一条龙。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use tracing::{debug, info, warn};

use crate::confirm::{ConfirmOutcome, Confirmer};
use crate::lander::{
    BundleDispatch, ChannelStack, Deadline, LanderError, RpcLander, TipFloorCache,
    effective_tip_ui,
};
use crate::monitoring::events;
use crate::simulate::Simulator;
use crate::tx::compiler::CheckpointAnchor;
use crate::tx::fees::sol_to_lamports;
use crate::tx::{
    BuildError, ChannelClass, CompiledTransaction, DecorationRequest, SubmittableTransaction,
    TransactionCompiler, decorator,
};

pub mod error;
pub mod report;

pub use error::{PipelineError, is_union_validation_defect};
pub use report::{OutcomeStatus, ProgressCallback, Reporter, TransactionOutcome};

/// 单次管线运行的总时限。
pub const PIPELINE_DEADLINE: Duration = Duration::from_secs(90);

/// 调用方声明的投递意向。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastType {
    Bundle,
    Rpc,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBroadcast {
    Direct,
    Bundle,
}

impl ResolvedBroadcast {
    fn class(&self) -> ChannelClass {
        match self {
            ResolvedBroadcast::Direct => ChannelClass::Direct,
            ResolvedBroadcast::Bundle => ChannelClass::Bundle,
        }
    }
}

/// DYNAMIC 意向按批大小拆分成具体通道。
#[derive(Debug, Clone, Copy)]
pub struct DynamicStrategy {
    pub single_tx: ResolvedBroadcast,
    pub multi_tx: ResolvedBroadcast,
}

impl Default for DynamicStrategy {
    fn default() -> Self {
        Self {
            single_tx: ResolvedBroadcast::Direct,
            multi_tx: ResolvedBroadcast::Bundle,
        }
    }
}

/// 每次 process 调用的参数。
#[derive(Clone)]
pub struct ProcessOptions {
    pub broadcast_type: BroadcastType,
    pub is_sequential: bool,
    pub priority_fee_micro: u64,
    /// bundle tip 基准值（SOL），行情只会抬高它。
    pub bundle_tip_ui: f64,
    pub max_cap_ui: Option<f64>,
    /// tip 的全局上限（SOL），0 表示不设限。
    pub max_tip_ui: f64,
    pub callback: Option<ProgressCallback>,
    pub dynamic_strategy: DynamicStrategy,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            broadcast_type: BroadcastType::Dynamic,
            is_sequential: false,
            priority_fee_micro: 0,
            bundle_tip_ui: 0.0,
            max_cap_ui: None,
            max_tip_ui: 0.0,
            callback: None,
            dynamic_strategy: DynamicStrategy::default(),
        }
    }
}

/// 直连发送的 RPC 侧参数。
#[derive(Debug, Clone, Copy)]
pub struct TransactionOptions {
    pub commitment: CommitmentConfig,
    pub skip_preflight: bool,
    pub max_retries: Option<usize>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            commitment: CommitmentConfig::confirmed(),
            skip_preflight: true,
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    Building,
    Simulating,
    Dispatching,
    Confirming,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Idle => "idle",
            PipelinePhase::Building => "building",
            PipelinePhase::Simulating => "simulating",
            PipelinePhase::Dispatching => "dispatching",
            PipelinePhase::Confirming => "confirming",
            PipelinePhase::Succeeded => "succeeded",
            PipelinePhase::PartiallyFailed => "partially_failed",
            PipelinePhase::Failed => "failed",
        }
    }
}

pub struct SubmissionPipeline {
    rpc: Arc<RpcClient>,
    http: reqwest::Client,
    stack: ChannelStack,
    tip_floor: Option<TipFloorCache>,
    simulate_endpoint: Option<String>,
    tx_options: TransactionOptions,
}

impl SubmissionPipeline {
    pub fn new(
        rpc: Arc<RpcClient>,
        http: reqwest::Client,
        stack: ChannelStack,
        tip_floor: Option<TipFloorCache>,
        simulate_endpoint: Option<String>,
        tx_options: TransactionOptions,
    ) -> Self {
        Self {
            rpc,
            http,
            stack,
            tip_floor,
            simulate_endpoint,
            tx_options,
        }
    }

    /// 整批处理：同一 checkpoint 下注入、编译、模拟、投递并确认。
    /// 返回与输入同序的签名列表。
    pub async fn process_transactions(
        &self,
        transactions: &[SubmittableTransaction],
        fee_payer: &Keypair,
        options: &ProcessOptions,
    ) -> Result<Vec<Signature>, PipelineError> {
        let started = Instant::now();
        let batch = transactions.len();
        if batch == 0 {
            return Ok(Vec::new());
        }

        let resolved = resolve_broadcast(batch, options);
        let mut phase = PipelinePhase::Building;
        debug!(
            target: "pipeline",
            phase = phase.as_str(),
            batch,
            broadcast = ?resolved,
            "开始处理批次"
        );

        let floor_ui = self.tip_floor.as_ref().and_then(TipFloorCache::latest_ui);
        let tip_ui = effective_tip_ui(options.bundle_tip_ui, floor_ui, options.max_tip_ui);
        let tip_lamports = sol_to_lamports(tip_ui);

        let reporter = Reporter::new(batch, options.callback.clone());
        let deadline = Deadline::after(PIPELINE_DEADLINE);
        let compiler = TransactionCompiler::new(self.rpc.clone(), self.tx_options.commitment);
        let confirmer = Confirmer::new(self.rpc.clone(), self.tx_options.commitment);

        let result = self
            .run(
                transactions,
                fee_payer,
                options,
                resolved,
                tip_lamports,
                &compiler,
                &confirmer,
                &reporter,
                deadline,
                &mut phase,
            )
            .await;

        let status = match &result {
            Ok(_) => {
                phase = PipelinePhase::Succeeded;
                "succeeded"
            }
            Err(_) => {
                phase = terminal_failure_phase(phase);
                phase.as_str()
            }
        };
        debug!(target: "pipeline", phase = phase.as_str(), "批次结束");
        events::pipeline_terminal(status, batch, reporter.landed_count(), started.elapsed());
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        transactions: &[SubmittableTransaction],
        fee_payer: &Keypair,
        options: &ProcessOptions,
        resolved: ResolvedBroadcast,
        tip_lamports: u64,
        compiler: &TransactionCompiler,
        confirmer: &Confirmer,
        reporter: &Reporter,
        deadline: Deadline,
        phase: &mut PipelinePhase,
    ) -> Result<Vec<Signature>, PipelineError> {
        let batch = transactions.len();
        // bundle 通道必须带 tip，任何网络请求之前就拒绝。
        if resolved.class() == ChannelClass::Bundle && tip_lamports == 0 {
            return Err(PipelineError::Building(BuildError::MissingBundleTip));
        }
        let checkpoint = compiler.fetch_checkpoint().await.map_err(PipelineError::Building)?;

        let mut addresses: Vec<Pubkey> = Vec::new();
        for tx in transactions {
            for address in &tx.lookup_tables {
                if !addresses.contains(address) {
                    addresses.push(*address);
                }
            }
        }
        let tables = compiler
            .resolve_lookup_tables(&addresses)
            .await
            .map_err(PipelineError::Building)?;

        // 草稿编译拿尺寸，预模拟拿消耗单位。
        let mut drafts = Vec::with_capacity(batch);
        for (index, tx) in transactions.iter().enumerate() {
            let instructions = compiler.instructions_of(tx, &tables)?;
            drafts.push(compiler.compile_instructions(
                index,
                &instructions,
                &tx.signers,
                &tables,
                &checkpoint,
                fee_payer,
            )?);
        }
        let sizes: Vec<usize> = drafts.iter().map(|draft| draft.serialized_size).collect();

        let simulator = Simulator::new(
            self.rpc.clone(),
            self.http.clone(),
            self.tx_options.commitment,
            self.simulate_endpoint.clone(),
        );
        let units = simulator.estimate_units(&drafts).await;

        let plan = decorator::plan(&DecorationRequest {
            channel: resolved.class(),
            fee_payer: fee_payer.pubkey(),
            priority_fee_micro: options.priority_fee_micro,
            tip_lamports,
            max_cap_ui: options.max_cap_ui,
            transactions,
            sizes: &sizes,
            units: &units,
        })?;

        let mut compiled = Vec::with_capacity(batch);
        for (index, tx) in transactions.iter().enumerate() {
            compiled.push(compiler.compile(
                index,
                tx,
                &plan.decorations[index].prefix,
                &tables,
                &checkpoint,
                fee_payer,
            )?);
        }
        // 独立 tip 交易只进 bundle，不参与逐笔直发。
        let tip_tx = match &plan.standalone_tip {
            Some(instruction) => Some(compiler.compile_instructions(
                batch,
                std::slice::from_ref(instruction),
                &[],
                &[],
                &checkpoint,
                fee_payer,
            )?),
            None => None,
        };

        *phase = PipelinePhase::Simulating;
        let gate_started = Instant::now();
        let gate_result = simulator.gate(&compiled, checkpoint.min_context_slot()).await;
        events::simulation_gate(batch, gate_result.is_ok(), gate_started.elapsed());
        gate_result?;

        *phase = PipelinePhase::Dispatching;
        let signatures: Vec<Signature> = compiled
            .iter()
            .map(CompiledTransaction::signature)
            .collect();

        match resolved {
            ResolvedBroadcast::Bundle => {
                self.dispatch_bundle(
                    &compiled,
                    tip_tx.as_ref(),
                    &signatures,
                    reporter,
                    confirmer,
                    &checkpoint,
                    deadline,
                    phase,
                )
                .await
            }
            ResolvedBroadcast::Direct => {
                let lander = self.direct_lander(&checkpoint);
                if options.is_sequential {
                    self.dispatch_direct_sequential(
                        &lander, &compiled, reporter, confirmer, &checkpoint, deadline, phase,
                    )
                    .await
                } else {
                    self.dispatch_direct_concurrent(
                        &lander, &compiled, reporter, confirmer, &checkpoint, deadline, phase,
                    )
                    .await
                }
            }
        }
    }

    fn direct_lander(&self, checkpoint: &CheckpointAnchor) -> RpcLander {
        RpcLander::new(
            self.rpc.clone(),
            Some(self.tx_options.skip_preflight),
            self.tx_options.max_retries,
            Some(checkpoint.min_context_slot()),
        )
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_bundle(
        &self,
        compiled: &[CompiledTransaction],
        tip_tx: Option<&CompiledTransaction>,
        signatures: &[Signature],
        reporter: &Reporter,
        confirmer: &Confirmer,
        checkpoint: &CheckpointAnchor,
        deadline: Deadline,
        phase: &mut PipelinePhase,
    ) -> Result<Vec<Signature>, PipelineError> {
        let wire = bundle_wire(compiled, tip_tx);

        match self.stack.submit_bundle(&wire, deadline).await {
            Ok(BundleDispatch::Bundle { channel, bundle_id }) => {
                info!(
                    target: "pipeline",
                    channel = channel.as_str(),
                    bundle_id,
                    "bundle 已确认落地"
                );
                reporter.record_bundle(&bundle_id, signatures);
                Ok(signatures.to_vec())
            }
            Ok(BundleDispatch::DirectFallback { sequential }) => {
                warn!(
                    target: "pipeline",
                    sequential,
                    "bundle 通道耗尽，降级为直连发送"
                );
                let lander = self.direct_lander(checkpoint);
                if sequential {
                    self.dispatch_direct_sequential(
                        &lander, compiled, reporter, confirmer, checkpoint, deadline, phase,
                    )
                    .await
                } else {
                    self.dispatch_direct_concurrent(
                        &lander, compiled, reporter, confirmer, checkpoint, deadline, phase,
                    )
                    .await
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 逐笔严格模式：上一笔确认落地才发下一笔，任何失败立即终止。
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_direct_sequential(
        &self,
        lander: &RpcLander,
        compiled: &[CompiledTransaction],
        reporter: &Reporter,
        confirmer: &Confirmer,
        checkpoint: &CheckpointAnchor,
        deadline: Deadline,
        phase: &mut PipelinePhase,
    ) -> Result<Vec<Signature>, PipelineError> {
        let mut landed = Vec::with_capacity(compiled.len());

        for (index, tx) in compiled.iter().enumerate() {
            let signature = match lander.submit(&tx.transaction, deadline).await {
                Ok(signature) => signature,
                Err(LanderError::Rpc(err)) if is_union_validation_defect(&err) => {
                    reporter.record(index, OutcomeStatus::FailedNetwork, None);
                    return Err(PipelineError::TransportDefect {
                        index,
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err.into()),
            };

            *phase = PipelinePhase::Confirming;
            let confirm_started = Instant::now();
            let outcome = confirmer
                .confirm_signature(&signature, checkpoint.last_valid_block_height)
                .await;
            events::confirmation_outcome(
                "signature",
                outcome_label(&outcome),
                confirm_started.elapsed(),
            );

            match outcome {
                ConfirmOutcome::Landed => {
                    reporter.record(index, OutcomeStatus::Landed, Some(signature));
                    landed.push(signature);
                }
                ConfirmOutcome::Expired => {
                    reporter.record(index, OutcomeStatus::Expired, Some(signature));
                    return Err(PipelineError::Expired { signature });
                }
                ConfirmOutcome::Failed(message) => {
                    reporter.record(index, OutcomeStatus::FailedValidation, Some(signature));
                    return Err(PipelineError::Confirmation { signature, message });
                }
                ConfirmOutcome::TimedOut => {
                    reporter.record(index, OutcomeStatus::FailedNetwork, Some(signature));
                    return Err(PipelineError::Confirmation {
                        signature,
                        message: "确认超时".into(),
                    });
                }
            }
        }

        Ok(landed)
    }

    /// 并发模式：先按序全部发出，再并发确认。
    /// union 校验缺陷按软失败记账，批末统一上抛。
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_direct_concurrent(
        &self,
        lander: &RpcLander,
        compiled: &[CompiledTransaction],
        reporter: &Reporter,
        confirmer: &Confirmer,
        checkpoint: &CheckpointAnchor,
        deadline: Deadline,
        phase: &mut PipelinePhase,
    ) -> Result<Vec<Signature>, PipelineError> {
        let mut sent: Vec<(usize, Signature)> = Vec::new();
        let mut defects: Vec<(usize, String)> = Vec::new();

        for (index, tx) in compiled.iter().enumerate() {
            match lander.submit(&tx.transaction, deadline).await {
                Ok(signature) => sent.push((index, signature)),
                Err(LanderError::Rpc(err)) if is_union_validation_defect(&err) => {
                    warn!(
                        target: "pipeline",
                        index,
                        error = %err,
                        "发送响应校验失败，交易可能已落地，继续发送剩余交易"
                    );
                    reporter.record(index, OutcomeStatus::FailedNetwork, None);
                    defects.push((index, err.to_string()));
                }
                Err(err) => return Err(err.into()),
            }
        }

        *phase = PipelinePhase::Confirming;
        let last_valid = checkpoint.last_valid_block_height;
        let mut confirmations = FuturesUnordered::new();
        for (index, signature) in &sent {
            let index = *index;
            let signature = *signature;
            confirmations.push(async move {
                let started = Instant::now();
                let outcome = confirmer.confirm_signature(&signature, last_valid).await;
                (index, signature, outcome, started.elapsed())
            });
        }

        let mut landed: Vec<(usize, Signature)> = Vec::new();
        let mut expired: Option<Signature> = None;
        let mut failed: Option<(Signature, String)> = None;
        while let Some((index, signature, outcome, elapsed)) = confirmations.next().await {
            events::confirmation_outcome("signature", outcome_label(&outcome), elapsed);
            match outcome {
                ConfirmOutcome::Landed => {
                    reporter.record(index, OutcomeStatus::Landed, Some(signature));
                    landed.push((index, signature));
                }
                ConfirmOutcome::Expired => {
                    reporter.record(index, OutcomeStatus::Expired, Some(signature));
                    expired.get_or_insert(signature);
                }
                ConfirmOutcome::Failed(message) => {
                    reporter.record(index, OutcomeStatus::FailedValidation, Some(signature));
                    failed.get_or_insert((signature, message));
                }
                ConfirmOutcome::TimedOut => {
                    reporter.record(index, OutcomeStatus::FailedNetwork, Some(signature));
                    failed.get_or_insert((signature, "确认超时".into()));
                }
            }
        }

        // 错误优先级：确定性失败 > 过期 > 传输缺陷。
        if let Some((signature, message)) = failed {
            return Err(PipelineError::Confirmation { signature, message });
        }
        if let Some(signature) = expired {
            return Err(PipelineError::Expired { signature });
        }
        if let Some((index, message)) = defects.into_iter().next() {
            // 并发软失败且有落地交易才算部分成功。
            if !landed.is_empty() {
                *phase = PipelinePhase::PartiallyFailed;
            }
            return Err(PipelineError::TransportDefect { index, message });
        }

        landed.sort_by_key(|(index, _)| *index);
        Ok(landed.into_iter().map(|(_, signature)| signature).collect())
    }
}

/// tip 交易领跑，批内交易保持原序跟随。
fn bundle_wire(
    compiled: &[CompiledTransaction],
    tip_tx: Option<&CompiledTransaction>,
) -> Vec<Vec<u8>> {
    let mut wire = Vec::with_capacity(compiled.len() + 1);
    if let Some(tip) = tip_tx {
        wire.push(tip.wire_bytes.clone());
    }
    wire.extend(compiled.iter().map(|tx| tx.wire_bytes.clone()));
    wire
}

/// 失败收尾：只有并发软失败路径会预先标记 PartiallyFailed，
/// 其余失败一律归入 Failed。
fn terminal_failure_phase(phase: PipelinePhase) -> PipelinePhase {
    if phase == PipelinePhase::PartiallyFailed {
        PipelinePhase::PartiallyFailed
    } else {
        PipelinePhase::Failed
    }
}

fn resolve_broadcast(batch: usize, options: &ProcessOptions) -> ResolvedBroadcast {
    match options.broadcast_type {
        BroadcastType::Bundle => ResolvedBroadcast::Bundle,
        BroadcastType::Rpc => ResolvedBroadcast::Direct,
        BroadcastType::Dynamic => {
            if batch == 1 {
                options.dynamic_strategy.single_tx
            } else {
                options.dynamic_strategy.multi_tx
            }
        }
    }
}

fn outcome_label(outcome: &ConfirmOutcome) -> &'static str {
    match outcome {
        ConfirmOutcome::Landed => "landed",
        ConfirmOutcome::Expired => "expired",
        ConfirmOutcome::Failed(_) => "failed",
        ConfirmOutcome::TimedOut => "timed_out",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_client::rpc_request::RpcError;
    use solana_sdk::hash::Hash;
    use solana_sdk::instruction::{AccountMeta, Instruction};
    use solana_sdk::message::VersionedMessage;
    use solana_sdk::message::v0::Message as V0Message;
    use solana_sdk::transaction::VersionedTransaction;

    fn compiled_with_bytes(bytes: Vec<u8>) -> CompiledTransaction {
        let payer = Keypair::new();
        let ix = Instruction {
            program_id: Pubkey::new_unique(),
            accounts: vec![AccountMeta::new(payer.pubkey(), true)],
            data: vec![1],
        };
        let message =
            V0Message::try_compile(&payer.pubkey(), &[ix], &[], Hash::default()).unwrap();
        let transaction =
            VersionedTransaction::try_new(VersionedMessage::V0(message), &[&payer]).unwrap();
        CompiledTransaction {
            transaction,
            serialized_size: bytes.len(),
            wire_bytes: bytes,
        }
    }

    #[tokio::test]
    async fn zero_tip_bundle_fails_before_any_rpc() {
        // 无任何 mock 的服务器：发出请求就会 501。
        let server = mockito::Server::new_async().await;
        let pipeline = SubmissionPipeline::new(
            Arc::new(RpcClient::new(server.url())),
            reqwest::Client::new(),
            ChannelStack::new(None, None, Vec::new()),
            None,
            None,
            TransactionOptions::default(),
        );
        let payer = Keypair::new();
        let tx = SubmittableTransaction::standard(vec![Instruction {
            program_id: Pubkey::new_unique(),
            accounts: vec![AccountMeta::new(payer.pubkey(), true)],
            data: vec![1, 2, 3],
        }]);

        let mut options = ProcessOptions::default();
        options.broadcast_type = BroadcastType::Bundle;
        options.bundle_tip_ui = 0.0;

        let err = pipeline
            .process_transactions(&[tx], &payer, &options)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Building(BuildError::MissingBundleTip)
        ));
    }

    #[test]
    fn partial_failure_needs_concurrent_soft_fail_marker() {
        assert_eq!(
            terminal_failure_phase(PipelinePhase::PartiallyFailed),
            PipelinePhase::PartiallyFailed
        );
        // 顺序模式的确认失败即便已有落地交易也是 Failed。
        assert_eq!(
            terminal_failure_phase(PipelinePhase::Confirming),
            PipelinePhase::Failed
        );
        assert_eq!(
            terminal_failure_phase(PipelinePhase::Dispatching),
            PipelinePhase::Failed
        );
    }

    #[test]
    fn tip_transaction_leads_bundle_payload() {
        let batch = vec![compiled_with_bytes(vec![1]), compiled_with_bytes(vec![2])];
        let tip = compiled_with_bytes(vec![9]);
        let wire = bundle_wire(&batch, Some(&tip));
        assert_eq!(wire, vec![vec![9], vec![1], vec![2]]);

        let without_tip = bundle_wire(&batch, None);
        assert_eq!(without_tip, vec![vec![1], vec![2]]);
    }

    #[test]
    fn dynamic_strategy_splits_on_batch_size() {
        let options = ProcessOptions::default();
        assert_eq!(resolve_broadcast(1, &options), ResolvedBroadcast::Direct);
        assert_eq!(resolve_broadcast(3, &options), ResolvedBroadcast::Bundle);
    }

    #[test]
    fn explicit_broadcast_overrides_dynamic() {
        let mut options = ProcessOptions::default();
        options.broadcast_type = BroadcastType::Bundle;
        assert_eq!(resolve_broadcast(1, &options), ResolvedBroadcast::Bundle);

        options.broadcast_type = BroadcastType::Rpc;
        assert_eq!(resolve_broadcast(5, &options), ResolvedBroadcast::Direct);
    }

    #[test]
    fn union_defect_detection_matches_marker() {
        let defect: solana_client::client_error::ClientError = RpcError::ForUser(
            "failed to deserialize: Expected the value to satisfy a union of `type | type`".into(),
        )
        .into();
        assert!(is_union_validation_defect(&defect));

        let other: solana_client::client_error::ClientError =
            RpcError::ForUser("connection refused".into()).into();
        assert!(!is_union_validation_defect(&other));
    }
}
