pub mod loader;
pub mod types;

pub use loader::{ConfigError, DEFAULT_CONFIG_PATHS, load_config};
pub use types::{
    BroadcastConfig, BroadcastTypeKind, ChannelName, CommitmentKind, ConnectionConfig,
    GlobalConfig, MagellanConfig, MonitoringConfig, RelayConfig, TipFloorLevelKind, WalletConfig,
};
