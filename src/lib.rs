pub mod cache;
pub mod config;
pub mod error;
pub mod forward;
pub mod handler;
pub mod inflight;
pub mod logging;
pub mod server;
pub mod tee;
pub mod validate;

pub use cache::CacheStore;
pub use config::Config;
pub use error::ProxyError;
pub use forward::ForwardRules;
pub use handler::ProxyHandler;
pub use server::ProxyServer;
