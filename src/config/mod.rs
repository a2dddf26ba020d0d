pub mod schema;

pub use schema::{
    ActuatorConfig, BrainConfig, Config, GatewayConfig, MonitorConfig, SchedulerConfig,
};
