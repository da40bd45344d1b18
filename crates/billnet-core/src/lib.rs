//! Core abstractions for the billnet dispatch subsystem.
//!
//! This crate defines the broker seam and the shared configuration used by
//! every other crate in the workspace.

pub mod broker;
pub mod config;

pub use broker::{
    BrokerError, DEFAULT_GROUP_CAPACITY, DEFAULT_PARTITIONS, Envelope, InMemoryBroker,
    MessageBroker, SharedBroker, Subscription, publish_json,
};
pub use config::{DispatchConfig, TopicNames};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::broker::{
        BrokerError, Envelope, InMemoryBroker, MessageBroker, SharedBroker, Subscription,
        publish_json,
    };
    pub use crate::config::{DispatchConfig, TopicNames, defaults, env_vars, groups, topics};
}
