//! Side-effecting helpers: vault layout, task files, engine, tools, audit.

pub mod audit;
pub mod claim;
pub mod config;
pub mod context;
pub mod engine;
pub mod layout;
pub mod plan;
pub mod process;
pub mod prompt;
pub mod ralph_log;
pub mod retry;
pub mod store;
pub mod tools;
