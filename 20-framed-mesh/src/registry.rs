//! Broadcast group of live connections with a bounded replay history.
//!
//! Members are keyed by [`ConnectionId`]. The registry holds only connection
//! handles; sockets belong to the connection tasks, so a member whose peer
//! went away is just a closed handle until the next delivery prunes it.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::{
    connection::{Connection, ConnectionId},
    error::{FrameError, TransportError},
    frame::{Frame, MAX_FRAME_LEN},
};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

#[derive(Debug)]
struct RegistryState {
    members: BTreeMap<ConnectionId, Connection>,
    history: VecDeque<Frame>,
    capacity: usize,
    max_frame_len: u32,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl Registry {
    /// A registry remembering the last `capacity` deliveries. Zero keeps none.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                members: BTreeMap::new(),
                history: VecDeque::with_capacity(capacity),
                capacity,
                max_frame_len: MAX_FRAME_LEN,
            }),
        }
    }

    /// Refuses deliveries whose frame would exceed `max_frame_len`, so nothing
    /// enters the history that members could not be sent.
    pub fn with_max_frame_len(self, max_frame_len: u32) -> Self {
        self.lock().max_frame_len = max_frame_len;
        self
    }

    /// Replays the history to `connection` in delivery order, then adds it.
    ///
    /// Replay and insertion happen under one lock, so a concurrent `deliver`
    /// lands either in the replay or after it, never before. A bounded write
    /// queue only gets the newest entries that fit. Entries the connection
    /// refuses are skipped; the member is added regardless. Returns the
    /// number of replayed payloads.
    pub fn join(&self, connection: Connection) -> usize {
        let mut state = self.lock();

        let skip = connection
            .queue_limit()
            .map_or(0, |limit| state.history.len().saturating_sub(limit));
        let mut replayed = 0;
        for frame in state.history.iter().skip(skip) {
            match connection.send_frame(frame.clone()) {
                Ok(()) => replayed += 1,
                Err(TransportError::Frame(error)) => {
                    debug!(id = connection.id(), %error, "skipping history entry");
                }
                Err(error) => {
                    debug!(id = connection.id(), %error, "replay aborted");
                    break;
                }
            }
        }

        trace!(id = connection.id(), replayed, "member joined");
        state.members.insert(connection.id(), connection);
        replayed
    }

    /// Records `payload` in the history and queues it on every live member.
    ///
    /// Closed members are pruned first. A member that fails to accept the
    /// frame is skipped without affecting the rest. Returns how many members
    /// the payload was queued on.
    pub fn deliver(&self, payload: impl AsRef<[u8]>) -> Result<usize, FrameError> {
        let mut state = self.lock();
        let frame = Frame::encode_limited(payload.as_ref(), state.max_frame_len)?;

        if state.capacity > 0 {
            if state.history.len() == state.capacity {
                state.history.pop_front();
            }
            state.history.push_back(frame.clone());
        }

        state.members.retain(|_, connection| !connection.is_closed());

        let mut delivered = 0;
        for connection in state.members.values() {
            match connection.send_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(error) => debug!(id = connection.id(), %error, "skipping member"),
            }
        }
        Ok(delivered)
    }

    pub fn leave(&self, id: ConnectionId) -> Option<Connection> {
        self.lock().members.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.lock().members.get(&id).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().members.contains_key(&id)
    }

    /// Number of members, including closed ones not yet pruned.
    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Payloads a newcomer would be replayed, oldest first.
    pub fn history(&self) -> Vec<Bytes> {
        self.lock().history.iter().map(Frame::payload).collect()
    }

    /// Closes and removes every member.
    pub fn close_all(&self) {
        let members = std::mem::take(&mut self.lock().members);
        for connection in members.values() {
            connection.close();
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
