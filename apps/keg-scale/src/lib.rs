pub mod config;
pub mod error;
pub mod http;
pub mod ingest;
pub mod message;
pub mod scale;
pub mod store;
