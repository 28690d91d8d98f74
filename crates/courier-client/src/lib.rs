//! Courier Client Library
//!
//! Session handling, command channels and the per-user folder layout for
//! the Courier relay client, independent of any front end.

pub mod channel;
pub mod client;
pub mod config;
pub mod events;
pub mod layout;
pub mod session;

pub use client::{Client, ClientOptions, TaskHandle};
pub use config::Config;
pub use events::{ClientEvent, EventReceiver, Notifier};
