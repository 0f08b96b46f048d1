pub mod cache;
pub mod cache_manager;
pub mod changes;
pub mod config;
pub mod dedupe;
pub mod fetcher;
mod fsutil;
pub mod media;
pub mod model;
pub mod nocodb;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod snapshot;
pub mod source;
