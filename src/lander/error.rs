use std::fmt;

use bincode::error::EncodeError;
use reqwest::Error as ReqwestError;
use solana_client::client_error::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LanderError {
    #[error("RPC 提交失败: {0}")]
    Rpc(#[from] ClientError),
    #[error("网络请求失败: {0}")]
    Network(#[from] ReqwestError),
    #[error("JSON 解析失败: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("序列化交易失败: {0}")]
    Encode(#[from] EncodeError),
    #[error("bundle 提交被拒: {message}")]
    Bundle {
        message: String,
        bundle_id: Option<String>,
    },
    #[error("bundle {bundle_id} 状态轮询无结论")]
    BundleUnresolved { bundle_id: String },
    #[error("{0}")]
    Fatal(String),
}

impl LanderError {
    pub fn fatal(reason: impl fmt::Display) -> Self {
        Self::Fatal(reason.to_string())
    }

    pub fn bundle(message: impl fmt::Display, bundle_id: Option<String>) -> Self {
        Self::Bundle {
            message: message.to_string(),
            bundle_id,
        }
    }

    /// 与 bundle 投递强相关的错误应触发通道降级而非整批失败。
    pub fn is_bundle_specific(&self) -> bool {
        matches!(
            self,
            LanderError::Bundle { .. } | LanderError::BundleUnresolved { .. }
        )
    }

    pub fn bundle_id(&self) -> Option<&str> {
        match self {
            LanderError::Bundle { bundle_id, .. } => bundle_id.as_deref(),
            LanderError::BundleUnresolved { bundle_id } => Some(bundle_id),
            _ => None,
        }
    }
}
