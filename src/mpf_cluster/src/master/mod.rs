//! Master node
//!
//! [`Master`] joins the group as a `MasterNode` member and runs one event
//! task that feeds channel traffic and table events to the
//! [`MasterCoordinator`].

pub mod config;
pub mod coordinator;

pub use config::{ClusterConfig, ConfigFormat, NodeManagerConfig, ServiceTemplate};
pub use coordinator::{ApplySummary, MasterCoordinator, MasterOptions};

use crate::{
    channel::{messages::StreamingJobMessage, ChannelEvent, GroupChannel, Substrate},
    identity::{self, NodeType},
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
};
use tracing::{debug, info};

/// Receives streaming-job messages reported by node managers
pub trait StreamingJobHandler: Send + Sync {
    fn handle(&self, src: &str, job: StreamingJobMessage);
}

#[derive(Debug, Clone)]
pub struct MasterSettings {
    pub host: String,
    pub description: String,
    pub connect_timeout: Duration,
    pub options: MasterOptions,
}

pub struct Master {
    channel: GroupChannel,
    coordinator: MasterCoordinator,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Master {
    /// Join the group and start processing events.
    ///
    /// Table events are handled by the master first and then forwarded to
    /// `listener`, if given.
    pub async fn start(
        substrate: Arc<dyn Substrate>,
        settings: MasterSettings,
        jobs: Option<Arc<dyn StreamingJobHandler>>,
        listener: Option<mpsc::UnboundedSender<ClusterEvent>>,
    ) -> eyre::Result<Self> {
        let channel = GroupChannel::new(substrate, settings.connect_timeout);
        let state = Arc::new(
            ClusterState::new(Arc::new(channel.clone()))
                .with_default_min_up_time(settings.options.default_min_up_time_millis),
        );
        let cluster_events = state.subscribe();
        let coordinator =
            MasterCoordinator::new(state.clone(), channel.clone(), settings.options, jobs);

        let address = identity::encode(NodeType::MasterNode, &settings.host, &settings.description);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        channel
            .connect(&address, state.clone(), events_tx)
            .await
            .wrap_err_with(|| format!("master {} failed to join the group", address))?;
        info!("Master joined as {}", address);

        if let Some(view) = channel.view() {
            state.reconcile_view(&view, true);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_events(
            coordinator.clone(),
            events_rx,
            cluster_events,
            listener,
            shutdown_rx,
        ));

        Ok(Self {
            channel,
            coordinator,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn coordinator(&self) -> &MasterCoordinator {
        &self.coordinator
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        self.coordinator.state()
    }

    pub fn address(&self) -> Option<String> {
        self.channel.local_address()
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot::capture(&self.channel, self.coordinator.state())
    }

    /// Stop the event task and leave the group. Services are not touched;
    /// call [`MasterCoordinator::shutdown_all`] first for that.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.await.ok();
        }
        self.channel.shutdown();
    }
}

async fn run_events(
    coordinator: MasterCoordinator,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut cluster_events: mpsc::UnboundedReceiver<ClusterEvent>,
    listener: Option<mpsc::UnboundedSender<ClusterEvent>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = channel_events.recv() => match event {
                Some(event) => coordinator.handle_channel_event(event),
                None => break,
            },
            Some(event) = cluster_events.recv() => {
                debug!("Cluster event {:?}", event);
                coordinator.handle_cluster_event(&event);
                if let Some(listener) = &listener {
                    listener.send(event).ok();
                }
            }
        }
    }
    debug!("Master event loop finished");
}
