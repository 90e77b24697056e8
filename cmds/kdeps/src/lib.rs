pub mod commands;
pub mod config;
pub mod dependency;
pub mod engine;
pub mod k8s;
pub mod list;
pub mod readiness;
pub mod telemetry;
#[cfg(test)]
pub mod test_utils;
