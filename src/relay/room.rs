//! Vault rooms: the per-vault multiplexer and offline buffers.
//!
//! Rooms are held in an arena keyed by vault id; connections carry only
//! `(vault_id, device_id)` and look rooms up under the lock. Broadcast
//! collects send handles under the lock and sends after releasing it, so a
//! slow socket never blocks the room.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::types::DeviceInfo;

/// Per-device offline ring capacity; the oldest frame is evicted first.
pub const OFFLINE_BUFFER_CAP: usize = 1000;

/// An online member: identity plus the handle that feeds its socket.
pub struct RoomMember {
    pub device_id: String,
    pub device_name: String,
    pub tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct VaultRoom {
    members: HashMap<String, RoomMember>,
    /// Raw wire frames waiting for offline devices. In-memory only: the
    /// relay never persists payload bytes.
    offline: HashMap<String, VecDeque<String>>,
}

impl VaultRoom {
    fn is_empty(&self) -> bool {
        self.members.is_empty() && self.offline.values().all(|q| q.is_empty())
    }
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, VaultRoom>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join (or create) the room for a vault. Returns any frames buffered
    /// while this device was offline, in arrival order.
    pub fn join(&self, vault_id: &str, member: RoomMember) -> Vec<String> {
        let mut rooms = self.rooms.lock().unwrap();
        let room = rooms.entry(vault_id.to_string()).or_default();
        let drained = room
            .offline
            .remove(&member.device_id)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default();
        room.members.insert(member.device_id.clone(), member);
        drained
    }

    /// Remove a device from its room. Empty rooms with no pending buffers
    /// are garbage-collected.
    pub fn leave(&self, vault_id: &str, device_id: &str) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(room) = rooms.get_mut(vault_id) {
            room.members.remove(device_id);
            if room.is_empty() {
                rooms.remove(vault_id);
            }
        }
    }

    /// Broadcast raw frame bytes to every member except `exclude`.
    /// Send handles are collected under the lock, sends happen after.
    pub fn broadcast(&self, vault_id: &str, raw: &str, exclude: Option<&str>) {
        let txs: Vec<mpsc::UnboundedSender<String>> = {
            let rooms = self.rooms.lock().unwrap();
            match rooms.get(vault_id) {
                Some(room) => room
                    .members
                    .values()
                    .filter(|m| exclude != Some(m.device_id.as_str()))
                    .map(|m| m.tx.clone())
                    .collect(),
                None => return,
            }
        };
        for tx in txs {
            // A closed channel just means the member is mid-disconnect.
            let _ = tx.send(raw.to_string());
        }
    }

    /// Direct-route raw bytes to one member. False when offline.
    pub fn send_to(&self, vault_id: &str, device_id: &str, raw: &str) -> bool {
        let tx = {
            let rooms = self.rooms.lock().unwrap();
            rooms
                .get(vault_id)
                .and_then(|room| room.members.get(device_id))
                .map(|m| m.tx.clone())
        };
        match tx {
            Some(tx) => tx.send(raw.to_string()).is_ok(),
            None => false,
        }
    }

    /// Append a frame to a device's offline ring, evicting the oldest past
    /// capacity.
    pub fn buffer_offline(&self, vault_id: &str, device_id: &str, raw: &str) {
        let mut rooms = self.rooms.lock().unwrap();
        let room = rooms.entry(vault_id.to_string()).or_default();
        let queue = room.offline.entry(device_id.to_string()).or_default();
        if queue.len() >= OFFLINE_BUFFER_CAP {
            queue.pop_front();
        }
        queue.push_back(raw.to_string());
    }

    pub fn is_online(&self, vault_id: &str, device_id: &str) -> bool {
        let rooms = self.rooms.lock().unwrap();
        rooms
            .get(vault_id)
            .is_some_and(|room| room.members.contains_key(device_id))
    }

    /// Current members of a room.
    pub fn members(&self, vault_id: &str) -> Vec<DeviceInfo> {
        let rooms = self.rooms.lock().unwrap();
        match rooms.get(vault_id) {
            Some(room) => {
                let mut list: Vec<DeviceInfo> = room
                    .members
                    .values()
                    .map(|m| DeviceInfo {
                        device_id: m.device_id.clone(),
                        device_name: m.device_name.clone(),
                    })
                    .collect();
                list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
                list
            }
            None => Vec::new(),
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }
}
