// statesync client library: dirty-state store, push channel and session lifecycle.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod poller;
pub mod project;
pub mod session;
pub mod store;
