use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_system_interface::instruction as system_instruction;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

mod config;
mod confirm;
mod instructions;
mod lander;
mod monitoring;
mod pipeline;
mod simulate;
mod supervisor;
mod tx;
mod wallet;

use config::{MagellanConfig, load_config};
use lander::{BlockEngineRelay, ChannelStack, ProxyRelay, TipFloorCache, fetch_tip_floor_once};
use pipeline::{PipelineError, ProcessOptions, SubmissionPipeline, TransactionOptions};
use solana_sdk::signer::Signer;
use tx::SubmittableTransaction;

#[derive(Parser, Debug)]
#[command(name = "magellan", version, about = "Solana 交易提交管线")]
struct Cli {
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "配置文件路径（默认查找 magellan.toml 或 config/magellan.toml）"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 提交一个交易批次
    Submit(SubmitCmd),
    /// 配置相关命令
    #[command(subcommand)]
    Config(ConfigCmd),
    /// 查询当前 tip floor 行情
    #[command(name = "tip-floor")]
    TipFloor,
}

#[derive(Args, Debug)]
struct SubmitCmd {
    #[arg(long, value_name = "FILE", help = "描述批次的 JSON 任务文件")]
    job: PathBuf,
    #[arg(long, help = "覆盖配置中的投递意向 (bundle/rpc/dynamic)")]
    broadcast: Option<String>,
    #[arg(long, help = "逐笔串行发送，上一笔确认后才发下一笔")]
    sequential: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    /// 打印解析后的配置
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.clone())?;
    init_tracing(&config)?;

    if config.monitoring.prometheus {
        monitoring::try_init_prometheus(&config.monitoring.listen).map_err(|err| anyhow!(err))?;
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("build http client")?;

    match cli.command {
        Command::Config(ConfigCmd::Show) => {
            println!("{config:#?}");
            Ok(())
        }
        Command::TipFloor => {
            let snapshot = fetch_tip_floor_once(&http, &config.relay.tip_floor_url)
                .await
                .map_err(|err| anyhow!("拉取 tip floor 失败: {err}"))?;
            println!("p50:   {:?}", snapshot.landed_tips_50th_percentile);
            println!("p75:   {:?}", snapshot.landed_tips_75th_percentile);
            println!("p95:   {:?}", snapshot.landed_tips_95th_percentile);
            println!("ema50: {:?}", snapshot.ema_landed_tips_50th_percentile);
            Ok(())
        }
        Command::Submit(cmd) => submit(cmd, &config, http).await,
    }
}

async fn submit(cmd: SubmitCmd, config: &MagellanConfig, http: reqwest::Client) -> Result<()> {
    let keypair_path = config
        .wallet
        .keypair_path
        .as_ref()
        .ok_or_else(|| anyhow!("配置缺少 wallet.keypair_path"))?;
    let fee_payer = wallet::load_keypair(keypair_path)?;

    let raw = tokio::fs::read_to_string(&cmd.job)
        .await
        .with_context(|| format!("读取任务文件 {} 失败", cmd.job.display()))?;
    let job: JobFile = serde_json::from_str(&raw).context("解析任务文件失败")?;
    let transactions = job.build_transactions(&fee_payer)?;
    if transactions.is_empty() {
        return Err(anyhow!("任务文件不含任何交易"));
    }

    let commitment = config.connection.commitment.to_commitment();
    let rpc = Arc::new(RpcClient::new_with_commitment(
        config.connection.rpc_url.clone(),
        commitment,
    ));

    let grpc = config.relay.proxy_url.as_ref().map(|url| {
        ProxyRelay::new(
            http.clone(),
            url.clone(),
            config.relay.block_engine_url.clone(),
        )
    });
    let http_api = BlockEngineRelay::new(http.clone(), config.relay.block_engine_endpoint());
    let stack = ChannelStack::new(
        grpc,
        Some(http_api),
        config.broadcast.fallback_channels(),
    );

    let tip_floor = if config.relay.tip_floor_enabled {
        Some(TipFloorCache::spawn(
            http.clone(),
            config.relay.tip_floor_url.clone(),
            config.relay.tip_floor_level.0,
            Duration::from_millis(config.relay.tip_floor_refresh_ms),
        ))
    } else {
        None
    };

    let pipeline = SubmissionPipeline::new(
        rpc,
        http,
        stack,
        tip_floor,
        config.connection.simulate_endpoint.clone(),
        TransactionOptions {
            commitment,
            skip_preflight: config.connection.skip_preflight,
            max_retries: config.connection.max_retries,
        },
    );

    let broadcast_type = match cmd.broadcast.as_deref() {
        Some("bundle") => pipeline::BroadcastType::Bundle,
        Some("rpc") => pipeline::BroadcastType::Rpc,
        Some("dynamic") | None => config.broadcast.broadcast_type.to_broadcast_type(),
        Some(other) => return Err(anyhow!("未知的投递意向: {other}")),
    };

    let options = ProcessOptions {
        broadcast_type,
        is_sequential: cmd.sequential || config.broadcast.sequential,
        priority_fee_micro: config.broadcast.priority_fee_micro,
        bundle_tip_ui: config.broadcast.tip_ui,
        max_cap_ui: config.broadcast.max_cap_ui,
        max_tip_ui: config.broadcast.max_tip_ui,
        callback: Some(Arc::new(|index, success, signature| {
            info!(
                target: "submit",
                index,
                success,
                signature,
                "交易终态"
            );
        })),
        dynamic_strategy: pipeline::DynamicStrategy::default(),
    };

    let signatures = supervisor::supervise(
        "submit",
        supervisor::SupervisorConfig::default(),
        |err: &PipelineError| err.is_retryable(),
        || {
            let pipeline = &pipeline;
            let transactions = &transactions;
            let fee_payer = &fee_payer;
            let options = options.clone();
            async move {
                pipeline
                    .process_transactions(transactions, fee_payer, &options)
                    .await
            }
        },
    )
    .await
    .map_err(|err| anyhow!("批次提交失败: {err}"))?;

    for signature in &signatures {
        println!("{signature}");
    }
    Ok(())
}

fn init_tracing(config: &MagellanConfig) -> Result<()> {
    let filter =
        EnvFilter::try_new(&config.global.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.global.log_json {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init();
    } else {
        fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// 任务文件：一个批次的交易描述。
#[derive(Debug, Deserialize)]
struct JobFile {
    transactions: Vec<JobTransaction>,
}

#[derive(Debug, Deserialize)]
struct JobTransaction {
    #[serde(default)]
    flashloan: bool,
    #[serde(default)]
    lookup_tables: Vec<String>,
    instructions: Vec<JobInstruction>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JobInstruction {
    Transfer { transfer: TransferSpec },
    Raw(RawInstruction),
}

#[derive(Debug, Deserialize)]
struct TransferSpec {
    to: String,
    lamports: u64,
}

#[derive(Debug, Deserialize)]
struct RawInstruction {
    program_id: String,
    #[serde(default)]
    accounts: Vec<JobAccount>,
    #[serde(default)]
    data_b58: String,
}

#[derive(Debug, Deserialize)]
struct JobAccount {
    pubkey: String,
    #[serde(default)]
    signer: bool,
    #[serde(default)]
    writable: bool,
}

impl JobFile {
    fn build_transactions(&self, fee_payer: &Keypair) -> Result<Vec<SubmittableTransaction>> {
        let payer = fee_payer.pubkey();
        let mut out = Vec::with_capacity(self.transactions.len());
        for entry in &self.transactions {
            let mut ixs = Vec::with_capacity(entry.instructions.len());
            for instruction in &entry.instructions {
                ixs.push(instruction.build(&payer)?);
            }
            let tables = entry
                .lookup_tables
                .iter()
                .map(|address| {
                    Pubkey::from_str(address)
                        .map_err(|err| anyhow!("查找表地址无效 {address}: {err}"))
                })
                .collect::<Result<Vec<_>>>()?;

            let tx = if entry.flashloan {
                SubmittableTransaction::flashloan(ixs)
            } else {
                SubmittableTransaction::standard(ixs)
            };
            out.push(tx.with_lookup_tables(tables));
        }
        Ok(out)
    }
}

impl JobInstruction {
    fn build(&self, payer: &Pubkey) -> Result<Instruction> {
        match self {
            JobInstruction::Transfer { transfer } => {
                let to = Pubkey::from_str(&transfer.to)
                    .map_err(|err| anyhow!("转账目标无效 {}: {err}", transfer.to))?;
                Ok(system_instruction::transfer(payer, &to, transfer.lamports))
            }
            JobInstruction::Raw(raw) => {
                let program_id = Pubkey::from_str(&raw.program_id)
                    .map_err(|err| anyhow!("program id 无效 {}: {err}", raw.program_id))?;
                let accounts = raw
                    .accounts
                    .iter()
                    .map(|account| {
                        let pubkey = Pubkey::from_str(&account.pubkey)
                            .map_err(|err| anyhow!("账户无效 {}: {err}", account.pubkey))?;
                        Ok(AccountMeta {
                            pubkey,
                            is_signer: account.signer,
                            is_writable: account.writable,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let data = if raw.data_b58.is_empty() {
                    Vec::new()
                } else {
                    bs58::decode(&raw.data_b58)
                        .into_vec()
                        .map_err(|err| anyhow!("指令数据 base58 解码失败: {err}"))?
                };
                Ok(Instruction {
                    program_id,
                    accounts,
                    data,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_file_builds_transactions() {
        let payer = Keypair::new();
        let recipient = Pubkey::new_unique();
        let raw = serde_json::json!({
            "transactions": [
                {
                    "instructions": [
                        { "transfer": { "to": recipient.to_string(), "lamports": 5000 } }
                    ]
                },
                {
                    "flashloan": true,
                    "lookup_tables": [Pubkey::new_unique().to_string()],
                    "instructions": [
                        {
                            "program_id": Pubkey::new_unique().to_string(),
                            "accounts": [
                                { "pubkey": payer.pubkey().to_string(), "signer": true, "writable": true }
                            ],
                            "data_b58": bs58::encode([1u8, 2, 3]).into_string()
                        }
                    ]
                }
            ]
        });

        let job: JobFile = serde_json::from_value(raw).expect("parse");
        let txs = job.build_transactions(&payer).expect("build");
        assert_eq!(txs.len(), 2);
        assert!(!txs[0].is_flashloan());
        assert!(txs[1].is_flashloan());
        assert_eq!(txs[1].lookup_tables.len(), 1);
        assert_eq!(txs[0].instructions[0].accounts[0].pubkey, payer.pubkey());
    }

    #[test]
    fn invalid_pubkey_is_rejected() {
        let payer = Keypair::new();
        let raw = serde_json::json!({
            "transactions": [
                { "instructions": [ { "transfer": { "to": "not-a-pubkey", "lamports": 1 } } ] }
            ]
        });
        let job: JobFile = serde_json::from_value(raw).expect("parse");
        assert!(job.build_transactions(&payer).is_err());
    }
}
