use reqwest::Error as ReqwestError;
use solana_client::client_error::ClientError;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use thiserror::Error;

use crate::lander::LanderError;
use crate::simulate::SimulateError;
use crate::tx::BuildError;

/// RPC 返回体没过客户端的 schema 校验时的标志文本。
/// 交易可能已被节点受理，这类错误不能当作确定性失败。
pub const UNION_VALIDATION_MARKER: &str = "Expected the value to satisfy a union";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("构建阶段失败: {0}")]
    Building(#[from] BuildError),
    #[error("模拟未通过 (交易 {index}): {message}")]
    Simulation {
        index: usize,
        message: String,
        logs: Vec<String>,
        /// 指令级错误时出错的程序账户。
        program_id: Option<Pubkey>,
    },
    #[error("模拟请求失败: {0}")]
    SimulationTransport(String),
    #[error("bundle 投递失败: {0}")]
    Bundle(String),
    #[error("交易 {index} 发送响应校验失败，可能已落地: {message}")]
    TransportDefect { index: usize, message: String },
    #[error("交易 {signature} 的 blockhash 已过期")]
    Expired { signature: Signature },
    #[error("交易 {signature} 确认失败: {message}")]
    Confirmation {
        signature: Signature,
        message: String,
    },
    #[error("RPC 请求失败: {0}")]
    Rpc(#[from] ClientError),
    #[error("网络请求失败: {0}")]
    Network(#[from] ReqwestError),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Building(_) => "building",
            PipelineError::Simulation { .. } => "simulation",
            PipelineError::SimulationTransport(_) => "simulation_transport",
            PipelineError::Bundle(_) => "bundle",
            PipelineError::TransportDefect { .. } => "transport_defect",
            PipelineError::Expired { .. } => "expired",
            PipelineError::Confirmation { .. } => "confirmation",
            PipelineError::Rpc(_) => "rpc",
            PipelineError::Network(_) => "network",
        }
    }

    /// 模拟失败时的程序日志，原样透传给调用方。
    pub fn logs(&self) -> Option<&[String]> {
        match self {
            PipelineError::Simulation { logs, .. } => Some(logs),
            _ => None,
        }
    }

    /// 过期类错误允许调用方换 checkpoint 重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Expired { .. })
    }
}

impl From<SimulateError> for PipelineError {
    fn from(err: SimulateError) -> Self {
        match err {
            SimulateError::Logical {
                index,
                message,
                logs,
                program_id,
            } => PipelineError::Simulation {
                index,
                message,
                logs,
                program_id,
            },
            SimulateError::Rpc(err) => PipelineError::Rpc(err),
            SimulateError::Network(err) => PipelineError::Network(err),
            SimulateError::Parse(message) => PipelineError::SimulationTransport(message),
        }
    }
}

impl From<LanderError> for PipelineError {
    fn from(err: LanderError) -> Self {
        match err {
            LanderError::Rpc(err) => PipelineError::Rpc(err),
            LanderError::Network(err) => PipelineError::Network(err),
            other => PipelineError::Bundle(other.to_string()),
        }
    }
}

/// 判定 ClientError 是否为响应体 union 校验缺陷。
pub fn is_union_validation_defect(err: &ClientError) -> bool {
    err.to_string().contains(UNION_VALIDATION_MARKER)
}
