//! Agent configuration: the YAML document, validation, and defaulting.

pub mod settings;


pub use settings::{
    AgentConfig, ListenProtocol, LoggingOptions, OperationMode, RuleOptions, ServiceConfig,
    SslOptions,
};
