//! Configuration and persistence

pub mod layout;
pub mod settings;
pub mod store;
