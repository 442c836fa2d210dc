//! vmfleet controller library.
//!
//! Keeps a fleet of VMs, each running a bot, in line with declarative
//! configs. The binary wires these pieces to Postgres and the real provider
//! APIs; the library surface exists so the whole pipeline can be driven in
//! process by integration tests.
//!
//! ## Pipeline
//!
//! ```text
//! ExpandConfig -> CreateVm -> CreateInstance -> ManageBot
//!                                                  |
//!                    DeleteBot <- DestroyInstance <+-> TerminateBot
//! ```
//!
//! Cron triggers start each stage from a scan of the store; handlers chain
//! the rest through the task queue.

pub mod api;
pub mod clock;
pub mod config;
pub mod cron;
pub mod db;
pub mod deps;
pub mod dispatch;
pub mod handlers;
pub mod metrics;
pub mod providers;
pub mod store;
