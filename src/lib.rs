pub mod cache;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod migrate;
pub mod mrt;
pub mod ris;
pub mod store;
pub mod window;
