//! Out-of-process plugin host: per-method proxy, request/response
//! multiplexing, and pooling with timed eviction (spec.md §4.4, C6).

mod factory;
mod proxy;

pub use factory::PluginFactory;
pub use proxy::PluginProxy;
