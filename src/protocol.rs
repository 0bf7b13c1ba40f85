//! Control protocol client.
//!
//! This module provides the Rust side of the device control protocol: a
//! JSON-RPC style request/response exchange over one TCP connection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐            TCP :1710          ┌─────────────────────┐
//! │  ControlClient  │  ◄──────────────────────────► │   control server    │
//! │  + reader task  │   JSON + NUL/LF terminators   │      (device)       │
//! └─────────────────┘                               └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Requests are single JSON objects followed by a NUL byte:
//!
//! ```text
//! {"protocolVersion":"2.0","method":"Logon","params":{"User":"u","Password":"p"},"id":1}\0
//! ```
//!
//! Responses echo the `id`. Messages without an `id` are pushed
//! notifications and are delivered as [`ClientEvent::Notification`].
//!
//! # Usage
//!
//! ```ignore
//! use controlrpc::protocol::ControlClient;
//!
//! let client = ControlClient::new();
//! client.connect("10.0.0.5", 1710).await?;
//! client.authenticate("admin", "secret").await?;
//! let components = client.list_components().await?;
//! ```

mod client;
mod commands;
mod error;
mod events;
pub mod framing;
pub mod message;

pub use client::{ClientConfig, ControlClient, DEFAULT_PORT};
pub use commands::{methods, ControlService};
pub use error::ControlError;
pub use events::{ClientEvent, DEFAULT_EVENT_BUFFER};
pub use framing::{write_frame, FrameBuffer, FramingError};
