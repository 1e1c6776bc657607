//! Server connection table.
//!
//! One arena owns every live [`Connection`]; two index maps point into it,
//! by connection id and by peer address.  Insertion and removal always touch
//! both indices, so a record is reachable through either key or through
//! neither.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::connection::Connection;

#[derive(Debug, Default)]
pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
    free: Vec<usize>,
    by_id: HashMap<u16, usize>,
    by_addr: HashMap<SocketAddr, usize>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Add `conn`.  Its id and address must not already be present.
    pub fn insert(&mut self, conn: Connection) {
        debug_assert!(!self.by_id.contains_key(&conn.id));
        debug_assert!(!self.by_addr.contains_key(&conn.addr));

        let (id, addr) = (conn.id, conn.addr);
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(conn);
                slot
            }
            None => {
                self.slots.push(Some(conn));
                self.slots.len() - 1
            }
        };
        self.by_id.insert(id, slot);
        self.by_addr.insert(addr, slot);
    }

    pub fn get(&self, id: u16) -> Option<&Connection> {
        let slot = *self.by_id.get(&id)?;
        self.slots[slot].as_ref()
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Connection> {
        let slot = *self.by_id.get(&id)?;
        self.slots[slot].as_mut()
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut Connection> {
        let slot = *self.by_addr.get(addr)?;
        self.slots[slot].as_mut()
    }

    pub fn contains(&self, id: u16) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Remove the record for `id` from the arena and both indices.
    pub fn remove(&mut self, id: u16) -> Option<Connection> {
        let slot = self.by_id.remove(&id)?;
        let conn = self.slots[slot].take()?;
        self.by_addr.remove(&conn.addr);
        self.free.push(slot);
        Some(conn)
    }

    /// Snapshot of live ids in ascending order.
    pub fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.slots.iter_mut().flatten()
    }
}
