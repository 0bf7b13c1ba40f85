//! controlrpc library
//!
//! This library provides the core components for talking to a device
//! control server and deploying scripts to it:
//!
//! - `protocol` - TCP client for the NUL-delimited JSON-RPC control protocol
//! - `models` - Component and control types returned by the server
//! - `deploy` - Component validation and script deployment
//! - `config` - Settings store for hosts and file-to-component mappings
//!
//! # Protocol Module
//!
//! ```ignore
//! use controlrpc::protocol::ControlClient;
//! use controlrpc::deploy::deploy_value;
//!
//! let client = ControlClient::new();
//! client.connect("10.0.0.5", 1710).await?;
//! client.authenticate("admin", "secret").await?;
//! deploy_value(&client, "MainScript", "code", "print('hi')".into()).await?;
//! client.disconnect().await;
//! ```

pub mod config;
pub mod deploy;
pub mod models;
pub mod protocol;
