//! Node manager
//!
//! One [`NodeManager`] runs per host. It joins the group as a `NodeManager`
//! member, announces itself, and runs an event task that applies channel
//! traffic and periodically reconciles its launchers with the tables.

pub mod coordinator;

pub use coordinator::ChildCoordinator;

use crate::{
    channel::{ChannelEvent, GroupChannel, Substrate},
    identity::{self, NodeType},
    launcher::{LauncherSettings, OutputHooks},
    state::{ClusterEvent, ClusterState},
    status::StatusSnapshot,
};
use eyre::WrapErr;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info};

/// Default period of the launcher reconcile pass
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct NodeManagerSettings {
    pub host: String,
    pub description: String,
    pub connect_timeout: Duration,
    pub reconcile_interval: Duration,
    pub launcher: LauncherSettings,
    pub hooks: OutputHooks,
}

pub struct NodeManager {
    channel: GroupChannel,
    coordinator: ChildCoordinator,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeManager {
    /// Join the group, announce this host and start the event task.
    pub async fn start(
        substrate: Arc<dyn Substrate>,
        settings: NodeManagerSettings,
    ) -> eyre::Result<Self> {
        let channel = GroupChannel::new(substrate, settings.connect_timeout);
        let state = Arc::new(ClusterState::new(Arc::new(channel.clone())));
        let coordinator = ChildCoordinator::new(
            settings.host.clone(),
            state.clone(),
            settings.launcher,
            settings.hooks,
        );

        let address =
            identity::encode(NodeType::NodeManager, &settings.host, &settings.description);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        channel
            .connect(&address, state.clone(), events_tx)
            .await
            .wrap_err_with(|| format!("node manager {} failed to join the group", address))?;
        info!("Node manager joined as {}", address);

        if let Some(view) = channel.view() {
            state.reconcile_view(&view, true);
        }
        coordinator.start();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_events(
            coordinator.clone(),
            events_rx,
            settings.reconcile_interval,
            shutdown_rx,
        ));

        Ok(Self {
            channel,
            coordinator,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn coordinator(&self) -> &ChildCoordinator {
        &self.coordinator
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        self.coordinator.state()
    }

    /// Table events seen by this node manager (single subscriber)
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterEvent> {
        self.coordinator.state().subscribe()
    }

    pub fn address(&self) -> Option<String> {
        self.channel.local_address()
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot::capture(&self.channel, self.coordinator.state())
    }

    /// Stop all local services, then leave the group.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.await.ok();
        }
        self.coordinator.shutdown_all().await;
        self.channel.shutdown();
        info!("Node manager on {} stopped", self.coordinator.host());
    }
}

async fn run_events(
    coordinator: ChildCoordinator,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    reconcile_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(reconcile_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = channel_events.recv() => match event {
                Some(event) => coordinator.handle_channel_event(event),
                None => break,
            },
            _ = ticker.tick() => coordinator.reconcile(),
        }
    }
    debug!("[node {}] Event loop finished", coordinator.host());
}
