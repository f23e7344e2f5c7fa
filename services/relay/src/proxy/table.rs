//! Fixed-capacity slot table.
//!
//! Slots are allocated once at startup and recycled through a free list
//! (a stack of free indices), so allocate and free are O(1). The table's
//! capacity is the relay's concurrency limit.

use std::io;
use std::net::{SocketAddr, TcpStream};

use thiserror::Error;

use super::slot::{Slot, SlotState};

/// Index of a slot in the table.
pub type SlotId = usize;

/// Errors from [`SlotTable::allocate`].
#[derive(Debug, Error)]
pub enum AllocateError {
    /// Every slot is live. The rejected client stream is handed back so the
    /// caller closes it explicitly.
    #[error("slot table full ({capacity} connections)")]
    Full { capacity: usize, client: TcpStream },

    /// The accepted stream could not be configured; it has been closed.
    #[error("failed to configure client stream: {0}")]
    Configure(#[from] io::Error),
}

/// Arena of connection slots with free-list allocation.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<SlotId>,
}

impl SlotTable {
    /// Create a table of `capacity` slots, each with two buffers of
    /// `buffer_capacity` bytes.
    pub fn new(capacity: usize, buffer_capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::new(buffer_capacity)).collect(),
            // Lowest index on top of the stack.
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live (non-empty) slots.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Bind an accepted client stream to a free slot.
    ///
    /// On success the slot is `Connecting` with both buffers reset; the origin
    /// connect still has to be issued.
    pub fn allocate(
        &mut self,
        client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<SlotId, AllocateError> {
        let Some(id) = self.free.pop() else {
            return Err(AllocateError::Full {
                capacity: self.capacity(),
                client,
            });
        };

        if let Err(e) = self.slots[id].open(client, peer_addr) {
            self.free.push(id);
            return Err(e.into());
        }
        Ok(id)
    }

    pub fn get(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(id).filter(|slot| !slot.is_empty())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots.get_mut(id).filter(|slot| !slot.is_empty())
    }

    /// Close both streams of a slot and return it to the free list.
    ///
    /// Idempotent; returns whether the slot was live.
    pub fn teardown(&mut self, id: SlotId) -> bool {
        let Some(slot) = self.slots.get_mut(id) else {
            return false;
        };
        if !slot.teardown() {
            return false;
        }
        self.free.push(id);
        true
    }

    /// Tear down every live slot. Returns how many were closed.
    pub fn teardown_all(&mut self) -> usize {
        (0..self.slots.len())
            .filter(|&id| self.teardown(id))
            .count()
    }

    /// Live slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.is_empty())
    }

    /// Number of live slots in `state`.
    pub fn count_in(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|slot| slot.state() == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::slot::tests::client_pair;
    use crate::proxy::slot::Side;
    use std::io::Read;

    #[test]
    fn test_allocate_until_full() {
        let mut table = SlotTable::new(2, 64);
        let mut peers = Vec::new();

        for expected in 0..2 {
            let (stream, addr, peer) = client_pair();
            peers.push(peer);
            assert_eq!(table.allocate(stream, addr).unwrap(), expected);
        }
        assert!(table.is_full());
        assert_eq!(table.len(), 2);
        assert_eq!(table.count_in(SlotState::Connecting), 2);

        let (stream, addr, mut rejected_peer) = client_pair();
        match table.allocate(stream, addr) {
            Err(AllocateError::Full { capacity, client }) => {
                assert_eq!(capacity, 2);
                drop(client);
            }
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(table.len(), 2, "occupied count must not change");

        let mut buf = [0u8; 1];
        assert_eq!(rejected_peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_teardown_recycles_slot() {
        let mut table = SlotTable::new(1, 64);

        let (stream, addr, _peer) = client_pair();
        let id = table.allocate(stream, addr).unwrap();
        assert!(table.teardown(id));
        assert!(table.is_empty());
        assert!(table.get(id).is_none());

        // Tearing down again is a no-op and does not double-free the index.
        assert!(!table.teardown(id));
        assert_eq!(table.len(), 0);

        let (stream, addr, _peer) = client_pair();
        assert_eq!(table.allocate(stream, addr).unwrap(), id);
        assert!(table.is_full());
    }

    #[test]
    fn test_teardown_leaves_other_slots_alone() {
        let mut table = SlotTable::new(3, 64);
        let mut peers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (stream, addr, peer) = client_pair();
            ids.push(table.allocate(stream, addr).unwrap());
            peers.push((addr, peer));
        }

        table.teardown(ids[1]);

        let live: Vec<_> = table.iter().map(|(id, _)| id).collect();
        assert_eq!(live, vec![ids[0], ids[2]]);
        assert_eq!(table.get(ids[0]).unwrap().peer_addr(), Some(peers[0].0));
        assert_eq!(table.get(ids[2]).unwrap().peer_addr(), Some(peers[2].0));
        assert!(table.get(ids[2]).unwrap().stream(Side::Client).is_some());
    }

    #[test]
    fn test_teardown_all() {
        let mut table = SlotTable::new(4, 64);
        let mut peers = Vec::new();
        for _ in 0..3 {
            let (stream, addr, peer) = client_pair();
            table.allocate(stream, addr).unwrap();
            peers.push(peer);
        }

        assert_eq!(table.teardown_all(), 3);
        assert!(table.is_empty());
        assert_eq!(table.teardown_all(), 0);
    }

    #[test]
    fn test_out_of_range_teardown() {
        let mut table = SlotTable::new(1, 64);
        assert!(!table.teardown(5));
        assert!(table.get_mut(5).is_none());
    }
}
