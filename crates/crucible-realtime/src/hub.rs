use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crucible_common::{room_name, Execution};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

/// Generous buffer so a slow subscriber practically never misses a
/// status transition; the backpressure policy in §4.3 forbids dropping
/// these.
const UPDATES_BUFFER_SIZE: usize = 1024;
/// Small buffer: log lines are allowed to drop under load rather than
/// stall the Worker's log-shipping path.
const LOGS_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RoomEvent {
    ExecutionUpdated { execution: Execution },
    ExecutionLog { task_id: String, log: String },
}

/// One room per organization: two independent broadcast channels so the
/// log channel can drop frames under backpressure without affecting the
/// updates channel.
pub struct Room {
    pub organization_id: String,
    updates_tx: broadcast::Sender<RoomEvent>,
    logs_tx: broadcast::Sender<RoomEvent>,
    subscriber_count: Arc<AtomicUsize>,
}

impl Room {
    fn new(organization_id: String) -> Self {
        let (updates_tx, _) = broadcast::channel(UPDATES_BUFFER_SIZE);
        let (logs_tx, _) = broadcast::channel(LOGS_BUFFER_SIZE);
        Self {
            organization_id,
            updates_tx,
            logs_tx,
            subscriber_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<RoomEvent> {
        self.updates_tx.subscribe()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<RoomEvent> {
        self.logs_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Relaxed)
    }
}

/// The Realtime Hub: org-scoped rooms fed exclusively by the trusted
/// internal publish path, joined only by subscribers carrying a verified
/// token for that organization.
#[derive(Clone)]
pub struct RealtimeHub {
    rooms: Arc<DashMap<String, Arc<Room>>>,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
        }
    }

    fn get_or_create_room(&self, organization_id: &str) -> Arc<Room> {
        self.rooms
            .entry(room_name(organization_id))
            .or_insert_with(|| Arc::new(Room::new(organization_id.to_string())))
            .clone()
    }

    /// Joins a subscriber to `org:{organizationId}`'s room, incrementing
    /// its live subscriber count. Call [`Self::leave`] on disconnect.
    pub fn join(&self, organization_id: &str) -> Arc<Room> {
        let room = self.get_or_create_room(organization_id);
        room.subscriber_count.fetch_add(1, Ordering::Relaxed);
        room
    }

    pub fn leave(&self, organization_id: &str) {
        if let Some(room) = self.rooms.get(&room_name(organization_id)) {
            room.subscriber_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Fans out a full execution snapshot to every member of the
    /// execution's organization's room. Never dropped under backpressure.
    pub fn publish_update(&self, organization_id: &str, execution: Execution) {
        let room = self.get_or_create_room(organization_id);
        let _ = room.updates_tx.send(RoomEvent::ExecutionUpdated { execution });
    }

    /// Fans out a single log line. Best-effort: dropped under
    /// backpressure rather than stalling the Worker.
    pub fn publish_log(&self, organization_id: &str, task_id: String, log: String) {
        let room = self.get_or_create_room(organization_id);
        let _ = room.logs_tx.send(RoomEvent::ExecutionLog { task_id, log });
    }

    pub fn active_room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_subscribers(&self) -> usize {
        self.rooms.iter().map(|entry| entry.subscriber_count()).sum()
    }
}
