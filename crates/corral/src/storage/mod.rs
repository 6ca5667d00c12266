pub mod memory_lease;
pub mod memory_message;
pub mod noop_runners;

#[cfg(feature = "sql")]
pub mod sql_lease;

#[cfg(feature = "sql")]
pub mod sql_mutex;
