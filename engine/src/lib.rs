//! fleetpipe library
//!
//! Deployment pipeline engine: releases an artifact onto a fleet of hosts by
//! running an ordered sequence of lifecycle hooks on every host, with a
//! barrier between stages, halt policies and rollback.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod utils;
