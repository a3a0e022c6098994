pub mod archive_controller;
pub mod broker;
pub mod config;
pub mod director;
pub mod error;
pub mod event;
pub mod fault;
pub mod heartbeat;
pub mod message;
pub mod scoreboard;
pub mod supervisor;
pub mod waiter;

pub use error::{ArchiverError, Result};
