//! In-process membership substrate
//!
//! Members joined to the same [`LocalSubstrate`] form one group. Views are
//! ordered by join time and the oldest member answers state requests. Used
//! when the master and node managers share a process, and by tests.

use super::{ChannelError, Substrate, SubstrateEvent};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

struct Member {
    address: String,
    events: mpsc::UnboundedSender<SubstrateEvent>,
}

#[derive(Default)]
pub struct LocalSubstrate {
    members: Mutex<Vec<Member>>,
}

impl LocalSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses in view order
    pub fn members(&self) -> Vec<String> {
        self.lock().iter().map(|m| m.address.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Member>> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_view(members: &[Member]) {
        let view: Vec<String> = members.iter().map(|m| m.address.clone()).collect();
        for member in members {
            // a member whose pump is gone is about to leave anyway
            member.events.send(SubstrateEvent::View(view.clone())).ok();
        }
    }
}

impl Substrate for LocalSubstrate {
    fn join(
        &self,
        address: &str,
        events: mpsc::UnboundedSender<SubstrateEvent>,
    ) -> Result<Vec<String>, ChannelError> {
        let mut members = self.lock();
        if members.iter().any(|m| m.address == address) {
            return Err(ChannelError::AddressInUse(address.to_string()));
        }
        members.push(Member {
            address: address.to_string(),
            events,
        });
        Self::publish_view(&members);
        Ok(members.iter().map(|m| m.address.clone()).collect())
    }

    fn leave(&self, address: &str) {
        let mut members = self.lock();
        let before = members.len();
        members.retain(|m| m.address != address);
        if members.len() != before {
            debug!("{} left the local group", address);
            Self::publish_view(&members);
        }
    }

    fn send(&self, src: &str, dest: Option<&str>, payload: Vec<u8>) -> Result<(), ChannelError> {
        let members = self.lock();
        match dest {
            None => {
                for member in members.iter().filter(|m| m.address != src) {
                    member
                        .events
                        .send(SubstrateEvent::Message {
                            src: src.to_string(),
                            payload: payload.clone(),
                        })
                        .ok();
                }
                Ok(())
            }
            Some(dest) => {
                let member = members
                    .iter()
                    .find(|m| m.address == dest)
                    .ok_or_else(|| ChannelError::UnknownMember(dest.to_string()))?;
                member
                    .events
                    .send(SubstrateEvent::Message {
                        src: src.to_string(),
                        payload,
                    })
                    .map_err(|_| ChannelError::Substrate(format!("{} is not receiving", dest)))
            }
        }
    }

    fn request_state(&self, requester: &str) -> Result<bool, ChannelError> {
        let members = self.lock();
        let Some(provider) = members.iter().find(|m| m.address != requester) else {
            return Ok(false);
        };
        provider
            .events
            .send(SubstrateEvent::StateRequest {
                requester: requester.to_string(),
            })
            .map_err(|_| {
                ChannelError::Substrate(format!("{} cannot provide state", provider.address))
            })?;
        Ok(true)
    }

    fn deliver_state(&self, dest: &str, snapshot: Vec<u8>) -> Result<(), ChannelError> {
        let members = self.lock();
        let member = members
            .iter()
            .find(|m| m.address == dest)
            .ok_or_else(|| ChannelError::UnknownMember(dest.to_string()))?;
        member
            .events
            .send(SubstrateEvent::State(snapshot))
            .map_err(|_| ChannelError::Substrate(format!("{} is not receiving", dest)))
    }
}
