//! Realtime fan-out substrate: a per-home monotonic event stream with a
//! bounded ring buffer so clients can resume from a cursor. Live delivery
//! rides a broadcast channel; replay reads the ring copy-on-read.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{CommandStatus, DeviceEvent, DeviceId, HomeId};

pub const DEFAULT_RING_CAPACITY: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    DeviceStateUpdated {
        device_db_id: DeviceId,
        device_id: String,
        state: serde_json::Value,
        last_seen: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        online: Option<bool>,
    },
    DeviceStatusChanged {
        device_db_id: DeviceId,
        online: bool,
        last_seen: DateTime<Utc>,
    },
    DeviceEventCreated {
        device_db_id: DeviceId,
        event: DeviceEvent,
    },
    CommandUpdated {
        #[serde(skip_serializing_if = "Option::is_none")]
        device_db_id: Option<DeviceId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hub_id: Option<String>,
        cmd_id: String,
        status: CommandStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        sent_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        acked_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    HubStatusChanged {
        hub_id: String,
        online: bool,
        last_seen: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    pub home_id: HomeId,
    pub seq: u64,
    pub event: StreamEvent,
}

/// Replay result for a resuming client.
#[derive(Debug, Clone, PartialEq)]
pub enum Replay {
    Events(Vec<SequencedEvent>),
    /// The cursor fell out of the ring window; the client must refetch
    /// snapshots before resuming.
    Resync,
}

struct HomeStream {
    next_seq: u64,
    ring: VecDeque<SequencedEvent>,
}

impl HomeStream {
    fn new() -> Self {
        Self { next_seq: 1, ring: VecDeque::new() }
    }
}

pub struct EventHub {
    homes: RwLock<HashMap<HomeId, HomeStream>>,
    capacity: usize,
    tx: broadcast::Sender<SequencedEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }
}

impl EventHub {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { homes: RwLock::new(HashMap::new()), capacity, tx }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Assigns the next per-home sequence number and fans the event out.
    pub fn publish(&self, home_id: HomeId, event: StreamEvent) -> SequencedEvent {
        let sequenced = {
            let mut homes = self.homes.write().unwrap();
            let stream = homes.entry(home_id).or_insert_with(HomeStream::new);
            let seq = stream.next_seq;
            stream.next_seq += 1;
            let sequenced = SequencedEvent { home_id, seq, event };
            stream.ring.push_back(sequenced.clone());
            while stream.ring.len() > self.capacity {
                stream.ring.pop_front();
            }
            sequenced
        };
        let _ = self.tx.send(sequenced.clone());
        sequenced
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequencedEvent> {
        self.tx.subscribe()
    }

    pub fn latest_seq(&self, home_id: HomeId) -> u64 {
        self.homes.read().unwrap().get(&home_id).map(|s| s.next_seq - 1).unwrap_or(0)
    }

    /// Everything after `cursor`, oldest first, or `Resync` when the cursor
    /// predates the ring window.
    pub fn replay_since(&self, home_id: HomeId, cursor: u64) -> Replay {
        let homes = self.homes.read().unwrap();
        let Some(stream) = homes.get(&home_id) else {
            // no events ever produced for this home
            return if cursor == 0 { Replay::Events(Vec::new()) } else { Replay::Resync };
        };
        let oldest = match stream.ring.front() {
            Some(ev) => ev.seq,
            None => stream.next_seq,
        };
        if cursor + 1 < oldest {
            return Replay::Resync;
        }
        let events = stream.ring.iter().filter(|ev| ev.seq > cursor).cloned().collect();
        Replay::Events(events)
    }
}
