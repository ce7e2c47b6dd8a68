pub mod api;
pub mod config;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod sweeper;
