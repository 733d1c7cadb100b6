// MIT License - Copyright (c) 2026 Peter Wright

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::dispatcher::{Dispatcher, RetryPolicy};
use crate::error::Result;
use crate::event::{ArmState, action_channel, event_channel};
use crate::imou::CameraCloud;
use crate::router::EventRouter;
use crate::server::SiaServer;

/// Bridge lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Starting,
    Listening,
    Draining,
    Stopped,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BridgeState::Starting => "starting",
            BridgeState::Listening => "listening",
            BridgeState::Draining => "draining",
            BridgeState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Owns the whole pipeline: listener → router → dispatcher.
///
/// Data flows one way. Connections push events into a bounded queue; a
/// single router task serializes the idempotence check and forwards
/// actions to a single dispatcher task, so actions for the account are
/// applied strictly in arrival order.
pub struct Bridge {
    state: BridgeState,
    local_addr: SocketAddr,
    router: Arc<EventRouter>,
    shutdown_tx: watch::Sender<bool>,
    server_handle: JoinHandle<()>,
    router_handle: JoinHandle<()>,
    dispatcher_handle: JoinHandle<()>,
    drain_grace: Duration,
}

impl Bridge {
    /// Bind the listener, probe the camera cloud (best effort) and wire
    /// the pipeline up. Returns once the bridge is listening.
    pub async fn start<C: CameraCloud + 'static>(
        config: BridgeConfig,
        cloud: Arc<C>,
    ) -> Result<Self> {
        Self::start_with_retry(config, cloud, RetryPolicy::default()).await
    }

    /// Like [`start`](Bridge::start) with an explicit retry policy.
    pub async fn start_with_retry<C: CameraCloud + 'static>(
        config: BridgeConfig,
        cloud: Arc<C>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        info!(state = %BridgeState::Starting, account = %config.account, "bridge starting");

        let (event_tx, mut event_rx) = event_channel(config.event_queue);
        let (action_tx, action_rx) = action_channel(config.action_queue);

        let server = SiaServer::bind(&config, event_tx).await?;
        let local_addr = server.local_addr()?;

        let mut dispatcher = Dispatcher::new(cloud, retry);

        // Reachability check; a cold cloud is not fatal, dispatch retries
        // on the first real action.
        if let Err(e) = dispatcher.probe().await {
            warn!(error = %e, "camera cloud probe failed, continuing anyway");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(server.run(shutdown_rx));

        let router = Arc::new(EventRouter::new());
        let router_task = Arc::clone(&router);
        let router_handle = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let Some(action) = router_task.observe(&event)
                    && action_tx.send(action).await.is_err()
                {
                    break;
                }
            }
        });

        let dispatcher_handle = tokio::spawn(dispatcher.run(action_rx));

        info!(state = %BridgeState::Listening, %local_addr, "bridge listening");
        Ok(Self {
            state: BridgeState::Listening,
            local_addr,
            router,
            shutdown_tx,
            server_handle,
            router_handle,
            dispatcher_handle,
            drain_grace: config.drain_grace,
        })
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// The bound listener address (resolves port 0 to the real port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The router's current view of the alarm state.
    pub fn arm_state(&self) -> ArmState {
        self.router.armed()
    }

    /// Drain and stop: close the listener, let queued dispatches finish
    /// within the grace period, then abandon whatever is left.
    pub async fn shutdown(mut self) -> BridgeState {
        if self.state != BridgeState::Listening {
            return self.state;
        }

        self.state = BridgeState::Draining;
        info!(state = %self.state, grace_secs = self.drain_grace.as_secs(), "bridge draining");
        let _ = self.shutdown_tx.send(true);

        // The listener and its connections stop first; once every event
        // sender is gone the router ends, the action queue closes, and
        // the dispatcher finishes the backlog.
        if timeout(self.drain_grace, &mut self.dispatcher_handle)
            .await
            .is_err()
        {
            warn!("drain grace expired, abandoning in-flight dispatch");
            self.dispatcher_handle.abort();
        }

        self.server_handle.abort();
        self.router_handle.abort();

        self.state = BridgeState::Stopped;
        info!(state = %self.state, "bridge stopped");
        self.state
    }
}
