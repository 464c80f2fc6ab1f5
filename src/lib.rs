pub mod backup;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod intercept;
pub mod logging;
pub mod network_log;
pub mod path;
pub mod record;
pub mod routing;
pub mod schema;
pub mod services;
pub mod store;
pub mod transport;
