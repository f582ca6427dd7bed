//! Deployment module

pub mod controller;
pub mod fsm;
pub mod hook_runner;
pub mod host_agent;
pub mod stage_executor;
