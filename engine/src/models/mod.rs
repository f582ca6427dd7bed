//! Data model

pub mod artifact;
pub mod deployment;
pub mod hook;
pub mod host;
