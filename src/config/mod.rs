//! Persistent application configuration

mod schema;
mod store;

pub use schema::*;
pub use store::ConfigStore;
