pub mod census;
pub mod config;
pub mod job_registry;
pub mod queue_group;
pub mod reaper;
pub mod registry;
pub mod resource_monitor;
pub mod signals;
pub mod supervisor;
#[cfg(test)]
pub(crate) mod test_support;
pub mod worker;
