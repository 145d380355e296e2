//! End-to-end realtime voice dialogue client.
//!
//! This crate speaks the Volcengine realtime dialogue wire protocol: a
//! length-prefixed binary frame format with per-event identifiers and
//! gzip-compressed payloads, carried over a single WebSocket.
//!
//! Layers, bottom up:
//!
//! - [`protocol`]: pure frame building and parsing, no I/O.
//! - [`DialogClient`]: one outbound WebSocket; sends events, runs the
//!   receive task, keeps the connection/session flags.
//! - [`DialogService`]: the dialogue as a stream of normalized
//!   [`DialogEvent`]s, with session bootstrap and local interruption.
//!
//! # Example
//!
//! ```rust,no_run
//! use ponytalk_dialog::{DialogConfig, DialogService, InputMod};
//!
//! # async fn example() -> ponytalk_dialog::Result<()> {
//! let mut dialog = DialogService::new(DialogConfig {
//!     app_id: "app-id".to_string(),
//!     access_key: "access-key".to_string(),
//!     ..Default::default()
//! });
//!
//! dialog.connect().await?;
//! dialog.start_session(InputMod::Audio).await?;
//! let mut events = dialog.take_events().expect("events taken once");
//!
//! dialog.say_hello(None).await?;
//! while let Some(event) = events.recv().await {
//!     // forward normalized events to the browser
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
pub mod protocol;
mod service;
mod types;

pub use client::{DialogClient, UpstreamError};
pub use config::{
    DialogConfig, InputMod, LocationInfo, APP_KEY_DIALOG, DEFAULT_DIALOGUE_URL, DEFAULT_GREETING,
    RESOURCE_DIALOG,
};
pub use error::{Error, Result};
pub use service::{convert_frame, DialogEvents, DialogService};
pub use types::DialogEvent;
