//! bundle 通道栈：按配置顺序尝试各投递通道，直到某个通道
//! 给出 bundle id，或者降级为直连 RPC 发送。

use std::time::{Duration, Instant};

use tracing::warn;

use crate::monitoring::events;
use crate::tx::ChannelClass;

use super::block_engine::BlockEngineRelay;
use super::error::LanderError;
use super::relay::ProxyRelay;

#[derive(Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn from_instant(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn after(duration: Duration) -> Self {
        Self(Instant::now() + duration)
    }

    pub fn expired(&self) -> bool {
        Instant::now() > self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastChannel {
    /// 内部代理路由，服务端持有 gRPC 连接。
    RelayGrpc,
    /// 直连 block engine 的 HTTP API。
    RelayHttpApi,
    /// bundle 降级：全部交易按序直发，不逐笔等确认。
    BundleViaDirectRetry,
    /// 逐笔直发，上一笔确认后才发下一笔。
    SequentialDirectRetry,
}

impl BroadcastChannel {
    pub fn class(&self) -> ChannelClass {
        match self {
            BroadcastChannel::RelayGrpc | BroadcastChannel::RelayHttpApi => ChannelClass::Bundle,
            BroadcastChannel::BundleViaDirectRetry | BroadcastChannel::SequentialDirectRetry => {
                ChannelClass::Direct
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastChannel::RelayGrpc => "relay_grpc",
            BroadcastChannel::RelayHttpApi => "relay_http_api",
            BroadcastChannel::BundleViaDirectRetry => "bundle_via_direct_retry",
            BroadcastChannel::SequentialDirectRetry => "sequential_direct_retry",
        }
    }
}

/// 通道栈一轮尝试的结果。
#[derive(Debug)]
pub enum BundleDispatch {
    Bundle {
        channel: BroadcastChannel,
        bundle_id: String,
    },
    /// bundle 通道耗尽，调用方改走直连发送。
    DirectFallback { sequential: bool },
}

#[derive(Clone)]
pub struct ChannelStack {
    grpc: Option<ProxyRelay>,
    http_api: Option<BlockEngineRelay>,
    fallback: Vec<BroadcastChannel>,
}

impl ChannelStack {
    pub fn new(
        grpc: Option<ProxyRelay>,
        http_api: Option<BlockEngineRelay>,
        fallback: Vec<BroadcastChannel>,
    ) -> Self {
        Self {
            grpc,
            http_api,
            fallback,
        }
    }

    pub fn fallback(&self) -> &[BroadcastChannel] {
        &self.fallback
    }

    /// 逐通道尝试投递。bundle 通道的失败只记录并携带
    /// tentative bundle id 传给下一通道。
    pub async fn submit_bundle(
        &self,
        wire_transactions: &[Vec<u8>],
        deadline: Deadline,
    ) -> Result<BundleDispatch, LanderError> {
        let mut tentative: Option<String> = None;
        let mut last_err: Option<LanderError> = None;

        for channel in &self.fallback {
            if deadline.expired() {
                return Err(last_err
                    .unwrap_or_else(|| LanderError::fatal("deadline expired before dispatch")));
            }

            events::channel_attempt(channel.as_str());
            let attempt = match channel {
                BroadcastChannel::RelayGrpc => {
                    let Some(relay) = &self.grpc else { continue };
                    relay.submit(wire_transactions, deadline).await
                }
                BroadcastChannel::RelayHttpApi => {
                    let Some(relay) = &self.http_api else { continue };
                    relay
                        .submit(wire_transactions, tentative.clone(), deadline)
                        .await
                }
                BroadcastChannel::BundleViaDirectRetry => {
                    events::channel_success(channel.as_str());
                    return Ok(BundleDispatch::DirectFallback { sequential: false });
                }
                BroadcastChannel::SequentialDirectRetry => {
                    events::channel_success(channel.as_str());
                    return Ok(BundleDispatch::DirectFallback { sequential: true });
                }
            };

            match attempt {
                Ok(bundle_id) => {
                    events::channel_success(channel.as_str());
                    return Ok(BundleDispatch::Bundle {
                        channel: *channel,
                        bundle_id,
                    });
                }
                Err(err) => {
                    if let Some(id) = err.bundle_id() {
                        tentative = Some(id.to_string());
                    }
                    events::channel_failure(channel.as_str());
                    warn!(
                        target: "lander::stack",
                        channel = channel.as_str(),
                        error = %err,
                        tentative = ?tentative,
                        "通道投递失败，尝试下一通道"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| LanderError::fatal("没有可用的投递通道")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_classes() {
        assert_eq!(BroadcastChannel::RelayGrpc.class(), ChannelClass::Bundle);
        assert_eq!(BroadcastChannel::RelayHttpApi.class(), ChannelClass::Bundle);
        assert_eq!(
            BroadcastChannel::BundleViaDirectRetry.class(),
            ChannelClass::Direct
        );
        assert_eq!(
            BroadcastChannel::SequentialDirectRetry.class(),
            ChannelClass::Direct
        );
    }

    #[tokio::test]
    async fn exhausted_relays_fall_back_to_direct() {
        let stack = ChannelStack::new(
            None,
            None,
            vec![
                BroadcastChannel::RelayGrpc,
                BroadcastChannel::RelayHttpApi,
                BroadcastChannel::BundleViaDirectRetry,
            ],
        );
        let dispatch = stack
            .submit_bundle(&[vec![1]], Deadline::after(Duration::from_secs(5)))
            .await
            .expect("dispatch");
        assert!(matches!(
            dispatch,
            BundleDispatch::DirectFallback { sequential: false }
        ));
    }

    #[tokio::test]
    async fn sequential_fallback_is_flagged() {
        let stack = ChannelStack::new(None, None, vec![BroadcastChannel::SequentialDirectRetry]);
        let dispatch = stack
            .submit_bundle(&[vec![1]], Deadline::after(Duration::from_secs(5)))
            .await
            .expect("dispatch");
        assert!(matches!(
            dispatch,
            BundleDispatch::DirectFallback { sequential: true }
        ));
    }

    #[tokio::test]
    async fn empty_stack_is_an_error() {
        let stack = ChannelStack::new(None, None, Vec::new());
        let err = stack
            .submit_bundle(&[vec![1]], Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, LanderError::Fatal(_)));
    }
}
