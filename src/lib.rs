pub mod analysis;
pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod ingest;
pub mod markdown;
pub mod models;
pub mod openai;
pub mod parser;
pub mod pipeline;
pub mod scoring;
pub mod selector;
pub mod utils;
