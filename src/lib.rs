pub mod api;
pub mod claim;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod matching;
pub mod model;
pub mod node;
pub mod notify;
pub mod settlement;
pub mod shutdown;
pub mod store;
