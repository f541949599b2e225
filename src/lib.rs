//! zellkern: a preloading application spawner.
//!
//! Applications are loaded into long-lived spawner processes once, and
//! workers are forked off the loaded image on demand.

pub mod application;
pub mod configuration;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod message_channel;
pub mod process;
pub mod request_handler;
pub mod signals;
pub mod spawner;
pub mod worker;
