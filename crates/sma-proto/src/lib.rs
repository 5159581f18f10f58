pub mod catalog;
pub mod config;
pub mod eq;
pub mod keys;
pub mod platform;
pub mod protocol;
pub mod state;
pub mod store;
