pub mod block_engine;
pub mod error;
pub mod relay;
pub mod rpc;
pub mod stack;
pub mod tipfloor;

pub use block_engine::BlockEngineRelay;
pub use error::LanderError;
pub use relay::ProxyRelay;
pub use rpc::RpcLander;
pub use stack::{BroadcastChannel, BundleDispatch, ChannelStack, Deadline};
pub use tipfloor::{TipFloorCache, TipFloorLevel, effective_tip_ui, fetch_tip_floor_once};
