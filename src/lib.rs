pub mod config;
pub mod error;
pub mod kite;
pub mod model;
pub mod normalizer;
pub mod notifier;
pub mod options;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod source;
