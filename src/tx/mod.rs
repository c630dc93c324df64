use std::sync::Arc;

use solana_client::client_error::ClientError;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::SignerError;
use solana_sdk::transaction::VersionedTransaction;
use thiserror::Error;

pub mod compiler;
pub mod decorator;
pub mod fees;

pub use compiler::{CheckpointAnchor, CompiledTransaction, TransactionCompiler};
pub use decorator::{
    ChannelClass, Decoration, DecorationPlan, DecorationRequest, MAX_TX_BYTES,
    PRIORITY_INSTRUCTION_BYTES, TIP_INSTRUCTION_BYTES,
};

/// 交易来源形态。版本化交易在构造时显式打标，绝不靠字段嗅探区分。
#[derive(Debug, Clone)]
pub enum TransactionKind {
    /// 普通指令列表，待编译。
    Standard,
    /// flashloan 封装交易：体积敏感且自闭合，跳过所有 fee/tip 注入。
    Flashloan,
    /// 已编译的版本化交易，重新锚定 checkpoint 前需先解包指令。
    Versioned(VersionedTransaction),
}

impl TransactionKind {
    pub fn is_flashloan(&self) -> bool {
        matches!(self, TransactionKind::Flashloan)
    }
}

/// 一笔待提交的抽象交易：指令序列 + 附加签名者 + 查找表引用。
/// 管线消费时不修改原对象，编译产物是新的 [`CompiledTransaction`]。
#[derive(Clone)]
pub struct SubmittableTransaction {
    pub instructions: Vec<Instruction>,
    pub signers: Vec<Arc<Keypair>>,
    pub lookup_tables: Vec<Pubkey>,
    pub kind: TransactionKind,
}

impl SubmittableTransaction {
    pub fn standard(instructions: Vec<Instruction>) -> Self {
        Self {
            instructions,
            signers: Vec::new(),
            lookup_tables: Vec::new(),
            kind: TransactionKind::Standard,
        }
    }

    pub fn flashloan(instructions: Vec<Instruction>) -> Self {
        Self {
            instructions,
            signers: Vec::new(),
            lookup_tables: Vec::new(),
            kind: TransactionKind::Flashloan,
        }
    }

    pub fn versioned(transaction: VersionedTransaction) -> Self {
        Self {
            instructions: Vec::new(),
            signers: Vec::new(),
            lookup_tables: Vec::new(),
            kind: TransactionKind::Versioned(transaction),
        }
    }

    pub fn with_signers(mut self, signers: Vec<Arc<Keypair>>) -> Self {
        self.signers = signers;
        self
    }

    pub fn with_lookup_tables(mut self, tables: Vec<Pubkey>) -> Self {
        self.lookup_tables = tables;
        self
    }

    pub fn is_flashloan(&self) -> bool {
        self.kind.is_flashloan()
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("获取最新 checkpoint 失败: {0}")]
    Checkpoint(#[source] ClientError),
    #[error("拉取 ALT 账户 {address} 失败: {source}")]
    LookupTableFetch {
        address: Pubkey,
        #[source]
        source: ClientError,
    },
    #[error("反序列化 ALT {address} 失败: {message}")]
    LookupTableDecode { address: Pubkey, message: String },
    #[error("找不到地址查找表 {0}，版本化交易无法解包")]
    LookupTableMissing(Pubkey),
    #[error("指令账户索引 {index} 超出账户数量 {total}")]
    AccountIndexOutOfBounds { index: usize, total: usize },
    #[error("编译交易消息失败: {0}")]
    Compile(String),
    #[error("签名交易失败: {0}")]
    Sign(#[from] SignerError),
    #[error("序列化交易失败: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("交易 {index} 超出大小上限: {size} > {limit}")]
    Oversize {
        index: usize,
        size: usize,
        limit: usize,
    },
    #[error("bundle 通道要求非零 tip")]
    MissingBundleTip,
    #[error("tip 钱包列表为空，无法构建 tip 指令")]
    NoTipWallet,
}
