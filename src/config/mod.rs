pub mod settings;

pub use settings::{
    BootConfig, DatabaseConfig, DhcpConfig, GitAuthConfig, GitConfig, InterfaceConfig,
    ObservabilityConfig, PoolConfig, ReservationConfig, ServerConfig, Settings, SubnetConfig,
};
