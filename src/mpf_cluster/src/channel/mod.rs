//! Group channel over a membership substrate
//!
//! The substrate (discovery, failure detection, delivery) is an external
//! collaborator reached through the [`Substrate`] trait. [`GroupChannel`]
//! wraps it with the cluster's contract:
//!
//! - `connect` joins under an encoded identity and blocks until the state
//!   snapshot from an existing member has been applied, or until this member
//!   turns out to be the founder (bounded by a timeout)
//! - `send(None, ..)` broadcasts, `send(Some(addr), ..)` unicasts
//! - `view` is `None` until connected
//! - `shutdown` leaves the group and is idempotent
//!
//! Incoming traffic is decoded on the channel's pump task and handed to the
//! owner as [`ChannelEvent`]s over an unbounded queue, so the substrate's
//! delivery path never waits on coordinator work.

pub mod local;
pub mod messages;

use messages::ClusterMessage;
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Default bound on waiting for the state snapshot while joining
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel is already connected as '{0}'")]
    AlreadyConnected(String),
    #[error("address '{0}' is already in use")]
    AddressInUse(String),
    #[error("member '{0}' is not part of the current view")]
    UnknownMember(String),
    #[error("failed to encode message")]
    Encode(#[from] serde_json::Error),
    #[error("substrate failure: {0}")]
    Substrate(String),
}

/// Raw event delivered by a substrate to one member
#[derive(Debug)]
pub enum SubstrateEvent {
    Message { src: String, payload: Vec<u8> },
    View(Vec<String>),
    /// Another member is joining and needs our state
    StateRequest { requester: String },
    /// Snapshot requested while joining
    State(Vec<u8>),
}

/// Membership substrate consumed by the channel
pub trait Substrate: Send + Sync + 'static {
    /// Join the group. Events for this member are pushed into `events`.
    /// Returns the view that includes the new member.
    fn join(
        &self,
        address: &str,
        events: mpsc::UnboundedSender<SubstrateEvent>,
    ) -> Result<Vec<String>, ChannelError>;

    fn leave(&self, address: &str);

    fn send(&self, src: &str, dest: Option<&str>, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Ask an existing member for a state snapshot on behalf of `requester`.
    /// Returns `false` when there is nobody to ask (founding member).
    fn request_state(&self, requester: &str) -> Result<bool, ChannelError>;

    fn deliver_state(&self, dest: &str, snapshot: Vec<u8>) -> Result<(), ChannelError>;
}

/// Replicated state handed to newcomers
pub trait StateSource: Send + Sync {
    fn snapshot(&self) -> eyre::Result<Vec<u8>>;
    fn restore(&self, snapshot: &[u8]) -> eyre::Result<()>;
}

/// Outgoing side used by the replicated tables
pub trait Publisher: Send + Sync {
    fn publish(&self, dest: Option<&str>, message: &ClusterMessage) -> Result<(), ChannelError>;
}

/// Decoded event handed to the channel owner
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message { src: String, message: ClusterMessage },
    View(Vec<String>),
}

#[derive(Clone)]
pub struct GroupChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    substrate: Arc<dyn Substrate>,
    connect_timeout: Duration,
    address: Mutex<Option<String>>,
    view: Mutex<Option<Vec<String>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl GroupChannel {
    pub fn new(substrate: Arc<dyn Substrate>, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                substrate,
                connect_timeout,
                address: Mutex::new(None),
                view: Mutex::new(None),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Join the group under `address`.
    ///
    /// Returns once the snapshot from an existing member has been restored
    /// into `state`, or immediately when this member founds the group. A
    /// snapshot that does not arrive within the connect timeout is logged and
    /// the member proceeds with whatever state it has.
    pub async fn connect(
        &self,
        address: &str,
        state: Arc<dyn StateSource>,
        receiver: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<(), ChannelError> {
        if let Some(existing) = lock(&self.inner.address).as_ref() {
            return Err(ChannelError::AlreadyConnected(existing.clone()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let view = self.inner.substrate.join(address, events_tx)?;
        debug!("Joined as {} with view {:?}", address, view);

        *lock(&self.inner.address) = Some(address.to_string());
        *lock(&self.inner.view) = Some(view);

        let (state_tx, state_rx) = oneshot::channel();
        let pump = tokio::spawn(pump_events(
            self.inner.clone(),
            events_rx,
            state,
            receiver,
            Some(state_tx),
        ));
        *lock(&self.inner.pump) = Some(pump);

        if self.inner.substrate.request_state(address)? {
            match tokio::time::timeout(self.inner.connect_timeout, state_rx).await {
                Ok(Ok(())) => info!("State transfer complete for {}", address),
                Ok(Err(_)) => warn!("State transfer for {} was abandoned", address),
                Err(_) => warn!(
                    "State transfer for {} timed out after {:?}, continuing with local state",
                    address, self.inner.connect_timeout
                ),
            }
        } else {
            info!("{} is the founding member", address);
        }

        Ok(())
    }

    /// Send to one member, or to everyone else when `dest` is `None`.
    pub fn send(&self, dest: Option<&str>, message: &ClusterMessage) -> Result<(), ChannelError> {
        let address = self.local_address().ok_or(ChannelError::NotConnected)?;
        let payload = message.encode()?;
        self.inner.substrate.send(&address, dest, payload)
    }

    /// Current member addresses, `None` before the first connect.
    pub fn view(&self) -> Option<Vec<String>> {
        lock(&self.inner.view).clone()
    }

    pub fn local_address(&self) -> Option<String> {
        lock(&self.inner.address).clone()
    }

    pub fn shutdown(&self) {
        let Some(address) = lock(&self.inner.address).take() else {
            return;
        };
        self.inner.substrate.leave(&address);
        *lock(&self.inner.view) = None;
        if let Some(pump) = lock(&self.inner.pump).take() {
            pump.abort();
        }
        debug!("{} left the group", address);
    }
}

impl Publisher for GroupChannel {
    fn publish(&self, dest: Option<&str>, message: &ClusterMessage) -> Result<(), ChannelError> {
        self.send(dest, message)
    }
}

async fn pump_events(
    inner: Arc<ChannelInner>,
    mut events: mpsc::UnboundedReceiver<SubstrateEvent>,
    state: Arc<dyn StateSource>,
    receiver: mpsc::UnboundedSender<ChannelEvent>,
    mut state_done: Option<oneshot::Sender<()>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SubstrateEvent::Message { src, payload } => match ClusterMessage::decode(&payload) {
                Ok(message) => {
                    receiver.send(ChannelEvent::Message { src, message }).ok();
                }
                Err(e) => warn!("Dropping undecodable message from {}: {}", src, e),
            },
            SubstrateEvent::View(members) => {
                *lock(&inner.view) = Some(members.clone());
                receiver.send(ChannelEvent::View(members)).ok();
            }
            SubstrateEvent::StateRequest { requester } => match state.snapshot() {
                Ok(snapshot) => {
                    if let Err(e) = inner.substrate.deliver_state(&requester, snapshot) {
                        warn!("Failed to hand state to {}: {}", requester, e);
                    }
                }
                Err(e) => error!("Failed to snapshot state for {}: {:#}", requester, e),
            },
            SubstrateEvent::State(snapshot) => {
                if let Err(e) = state.restore(&snapshot) {
                    error!("Failed to restore state snapshot: {:#}", e);
                }
                if let Some(done) = state_done.take() {
                    done.send(()).ok();
                }
            }
        }
    }
    debug!("Channel event pump finished");
}
