pub mod rest;
pub mod types;

pub use rest::KiteRestClient;
pub use types::Instrument;
