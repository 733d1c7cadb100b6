// MIT License - Copyright (c) 2026 Peter Wright

//! # sia2imou
//!
//! Bridge daemon between an alarm panel speaking SIA DC-09 over TCP and
//! the Imou camera cloud: arming the system restores camera capture,
//! disarming it shuts the lenses (privacy mode).
//!
//! The pipeline is strictly one-directional. The listener decodes and
//! authenticates frames, the router turns arm/disarm transitions into
//! camera actions exactly once, and the dispatcher applies them to every
//! registered camera with retry, backoff and token refresh.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sia2imou::{Bridge, BridgeConfig, ImouClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::from_env()?;
//!     let cloud = Arc::new(ImouClient::new(&config)?);
//!
//!     let bridge = Bridge::start(config, cloud).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod imou;
pub mod protocol;
pub mod router;
pub mod server;

// Re-exports for convenience
pub use bridge::{Bridge, BridgeState};
pub use config::{BridgeConfig, BridgeConfigBuilder};
pub use crypto::SiaCrypt;
pub use dispatcher::{CameraResult, CameraStatus, DispatchReport, Dispatcher, RetryPolicy};
pub use error::{BridgeError, Result};
pub use event::{ArmState, CameraAction, SiaEvent};
pub use imou::{CameraCloud, CameraDevice, Credential, ImouClient};
pub use router::EventRouter;
pub use server::SiaServer;
