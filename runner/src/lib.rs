pub mod collector;
pub mod config;
pub mod controller;
pub mod database;
pub mod optimizer;
pub mod pipeline;
pub mod pruner;
pub mod report;
pub mod result;
pub mod scheduler;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;
