pub mod actuation;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod quota;
pub mod store;
pub mod wal;
