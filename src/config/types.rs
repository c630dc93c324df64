use std::fmt;

use serde::de::{Error as DeError, Unexpected, Visitor};
use serde::{Deserialize, Deserializer};
use solana_commitment_config::CommitmentConfig;

use crate::lander::{BroadcastChannel, TipFloorLevel};
use crate::pipeline::BroadcastType;

pub const DEFAULT_BLOCK_ENGINE_URL: &str = "https://mainnet.block-engine.jito.wtf/api/v1/bundles";
pub const DEFAULT_TIP_FLOOR_URL: &str = "https://bundles.jito.wtf/api/v1/bundles/tip_floor";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MagellanConfig {
    pub global: GlobalConfig,
    pub connection: ConnectionConfig,
    pub wallet: WalletConfig,
    pub broadcast: BroadcastConfig,
    pub relay: RelayConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub log_level: String,
    pub log_json: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub rpc_url: String,
    pub commitment: CommitmentKind,
    pub skip_preflight: bool,
    pub max_retries: Option<usize>,
    /// 批量模拟可分流到独立端点，留空则用主 RPC。
    pub simulate_endpoint: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            commitment: CommitmentKind::Confirmed,
            skip_preflight: true,
            max_retries: None,
            simulate_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WalletConfig {
    pub keypair_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub broadcast_type: BroadcastTypeKind,
    pub sequential: bool,
    pub priority_fee_micro: u64,
    pub max_cap_ui: Option<f64>,
    /// bundle tip 基准值（SOL）。
    pub tip_ui: f64,
    /// tip 全局上限（SOL），0 表示不设限。
    pub max_tip_ui: f64,
    pub fallback: Vec<ChannelName>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            broadcast_type: BroadcastTypeKind::Dynamic,
            sequential: false,
            priority_fee_micro: 0,
            max_cap_ui: None,
            tip_ui: 0.0,
            max_tip_ui: 0.0,
            fallback: vec![
                ChannelName(BroadcastChannel::RelayGrpc),
                ChannelName(BroadcastChannel::RelayHttpApi),
                ChannelName(BroadcastChannel::BundleViaDirectRetry),
                ChannelName(BroadcastChannel::SequentialDirectRetry),
            ],
        }
    }
}

impl RelayConfig {
    /// 提交端点，带上限流 uuid（若有）。
    pub fn block_engine_endpoint(&self) -> String {
        match &self.uuid {
            Some(uuid) if !uuid.is_empty() => format!("{}?uuid={uuid}", self.block_engine_url),
            _ => self.block_engine_url.clone(),
        }
    }
}

impl BroadcastConfig {
    pub fn fallback_channels(&self) -> Vec<BroadcastChannel> {
        self.fallback.iter().map(|name| name.0).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub proxy_url: Option<String>,
    pub block_engine_url: String,
    /// block engine 分配的限流 uuid，追加为查询参数。
    pub uuid: Option<String>,
    pub tip_floor_url: String,
    pub tip_floor_refresh_ms: u64,
    pub tip_floor_level: TipFloorLevelKind,
    /// 关掉后不启动行情轮询，tip 只用静态配置。
    pub tip_floor_enabled: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            block_engine_url: DEFAULT_BLOCK_ENGINE_URL.to_string(),
            uuid: None,
            tip_floor_url: DEFAULT_TIP_FLOOR_URL.to_string(),
            tip_floor_refresh_ms: 5_000,
            tip_floor_level: TipFloorLevelKind(TipFloorLevel::P75),
            tip_floor_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub prometheus: bool,
    pub listen: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus: false,
            listen: "0.0.0.0:9464".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitmentKind {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl CommitmentKind {
    pub fn to_commitment(self) -> CommitmentConfig {
        match self {
            CommitmentKind::Processed => CommitmentConfig::processed(),
            CommitmentKind::Confirmed => CommitmentConfig::confirmed(),
            CommitmentKind::Finalized => CommitmentConfig::finalized(),
        }
    }
}

impl<'de> Deserialize<'de> for CommitmentKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct KindVisitor;

        impl<'de> Visitor<'de> for KindVisitor {
            type Value = CommitmentKind;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("one of: processed, confirmed, finalized")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: DeError,
            {
                match value.trim().to_ascii_lowercase().as_str() {
                    "processed" => Ok(CommitmentKind::Processed),
                    "confirmed" => Ok(CommitmentKind::Confirmed),
                    "finalized" => Ok(CommitmentKind::Finalized),
                    other => Err(DeError::unknown_variant(
                        other,
                        &["processed", "confirmed", "finalized"],
                    )),
                }
            }
        }

        deserializer.deserialize_str(KindVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastTypeKind {
    Bundle,
    Rpc,
    #[default]
    Dynamic,
}

impl BroadcastTypeKind {
    pub fn to_broadcast_type(self) -> BroadcastType {
        match self {
            BroadcastTypeKind::Bundle => BroadcastType::Bundle,
            BroadcastTypeKind::Rpc => BroadcastType::Rpc,
            BroadcastTypeKind::Dynamic => BroadcastType::Dynamic,
        }
    }
}

impl<'de> Deserialize<'de> for BroadcastTypeKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct KindVisitor;

        impl<'de> Visitor<'de> for KindVisitor {
            type Value = BroadcastTypeKind;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("one of: bundle, rpc, dynamic")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: DeError,
            {
                match value.trim().to_ascii_lowercase().as_str() {
                    "bundle" => Ok(BroadcastTypeKind::Bundle),
                    "rpc" => Ok(BroadcastTypeKind::Rpc),
                    "dynamic" => Ok(BroadcastTypeKind::Dynamic),
                    other => Err(DeError::unknown_variant(
                        other,
                        &["bundle", "rpc", "dynamic"],
                    )),
                }
            }
        }

        deserializer.deserialize_str(KindVisitor)
    }
}

/// 配置里的通道名，字符串与 [`BroadcastChannel::as_str`] 对应。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelName(pub BroadcastChannel);

impl<'de> Deserialize<'de> for ChannelName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct NameVisitor;

        impl<'de> Visitor<'de> for NameVisitor {
            type Value = ChannelName;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(
                    "one of: relay_grpc, relay_http_api, bundle_via_direct_retry, sequential_direct_retry",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: DeError,
            {
                match value.trim().to_ascii_lowercase().as_str() {
                    "relay_grpc" => Ok(ChannelName(BroadcastChannel::RelayGrpc)),
                    "relay_http_api" => Ok(ChannelName(BroadcastChannel::RelayHttpApi)),
                    "bundle_via_direct_retry" => {
                        Ok(ChannelName(BroadcastChannel::BundleViaDirectRetry))
                    }
                    "sequential_direct_retry" => {
                        Ok(ChannelName(BroadcastChannel::SequentialDirectRetry))
                    }
                    other => Err(DeError::unknown_variant(
                        other,
                        &[
                            "relay_grpc",
                            "relay_http_api",
                            "bundle_via_direct_retry",
                            "sequential_direct_retry",
                        ],
                    )),
                }
            }
        }

        deserializer.deserialize_str(NameVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipFloorLevelKind(pub TipFloorLevel);

impl<'de> Deserialize<'de> for TipFloorLevelKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct LevelVisitor;

        impl<'de> Visitor<'de> for LevelVisitor {
            type Value = TipFloorLevelKind;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("one of: p50, p75, p95, ema50")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: DeError,
            {
                match value.trim().to_ascii_lowercase().as_str() {
                    "p50" => Ok(TipFloorLevelKind(TipFloorLevel::P50)),
                    "p75" => Ok(TipFloorLevelKind(TipFloorLevel::P75)),
                    "p95" => Ok(TipFloorLevelKind(TipFloorLevel::P95)),
                    "ema50" => Ok(TipFloorLevelKind(TipFloorLevel::Ema50)),
                    _other => Err(DeError::invalid_value(Unexpected::Str(value), &self)),
                }
            }
        }

        deserializer.deserialize_str(LevelVisitor)
    }
}
