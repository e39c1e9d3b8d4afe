pub mod config;
pub mod connect;
pub mod provision;
pub mod secret;
pub mod types;

pub use config::{
    BrokerConfig, CandidateList, ConfigError, ConfigSummary, DeviceConfig, NetworkCandidate,
    RemoteDatabaseConfig, SensorConfig, TimeSyncConfig,
};
pub use connect::{
    connect_first_available, CandidateConnector, ConnectError, ConnectedNetwork,
    ConnectionPolicy, JoinOutcome,
};
pub use provision::{apply_provisioned, parse_network_list, seed_device_config, OverrideMode};
pub use types::{Measurement, NodeStatus};
