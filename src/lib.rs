//! Resilient FreeSWITCH event socket (ESL) client
//!
//! One background task owns the TCP connection: it dials, authenticates,
//! replays filters and event subscriptions, reads the stream and reconnects
//! after any failure. Callers talk to it through two handles:
//! - [`EslClient`] (Clone + Send): issue commands from any task
//! - [`EslEventStream`]: receive decoded events
//!
//! Commands are strictly serialized, one on the wire at a time, so each reply
//! is matched to the command written just before it. A command caught by a
//! disconnect fails with a connection error instead of hanging; retrying it
//! rides the next successful reconnect.
//!
//! Events go through a bounded channel. A consumer that falls behind loses
//! events (logged and counted) rather than stalling the read loop.
//!
//! # Example
//!
//! ```rust,no_run
//! use fsclient::{ClientConfig, EslClient, Subscriptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fsclient::EslError> {
//!     let config = ClientConfig::new("127.0.0.1:8021", "ClueCon").with_subscriptions(
//!         Subscriptions::new()
//!             .filter("Event-Name HEARTBEAT")
//!             .event("HEARTBEAT"),
//!     );
//!
//!     let (client, mut events) = EslClient::builder(config)
//!         .on_connect(|client| async move {
//!             if let Ok(version) = client.api("version").await {
//!                 println!("connected to {}", version.trim());
//!             }
//!         })
//!         .start()?;
//!
//!     client.wait_connected(Duration::from_secs(5)).await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{}", event.to_json()?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod subscription;

pub(crate) mod buffer;
pub(crate) mod constants;
pub(crate) mod correlator;
pub(crate) mod dispatcher;
pub(crate) mod protocol;

pub use client::{EslClient, EslClientBuilder, EslEventStream};
pub use command::{EslCommand, EslResponse};
pub use config::{AuthRetryPolicy, ClientConfig};
pub use connection::{ConnectionStatus, DisconnectReason};
pub use constants::{DEFAULT_ADDRESS, DEFAULT_ESL_PORT, DEFAULT_PASSWORD};
pub use error::{EslError, EslResult};
pub use event::EslEvent;
pub use protocol::{percent_decode_field, MessageType};
pub use subscription::Subscriptions;
