//! Table of the nodes currently known to be in range.
//!
//! The table has a fixed number of slots chosen at construction. Every
//! operation takes the single table lock, and the registered
//! [NeighborObserver] is called while that lock is held: an observer must
//! therefore never call back into the table.
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::{LinkQuality, NodeId};

/// Kind of change reported to a [NeighborObserver].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum NeighborEvent {
    Add,
    Remove,
    /// A known neighbor was heard again with a different link quality.
    Update,
}

/// Receives the changes of a [NeighborTable].
pub trait NeighborObserver: Send + Sync {
    fn neighbor_event(&self, event: NeighborEvent, id: NodeId, quality: LinkQuality);
}

impl<F> NeighborObserver for F
where
    F: Fn(NeighborEvent, NodeId, LinkQuality) + Send + Sync,
{
    fn neighbor_event(&self, event: NeighborEvent, id: NodeId, quality: LinkQuality) {
        self(event, id, quality)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Neighbor {
    pub id: NodeId,
    /// Link quality of the last frame heard from this node.
    pub quality: LinkQuality,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NeighborError {
    #[error("Neighbor table full ({capacity} entries)!")]
    TableFull { capacity: usize },
}

pub struct NeighborTable {
    slots: Mutex<Vec<Option<Neighbor>>>,
    observer: Option<Box<dyn NeighborObserver>>,
}

impl NeighborTable {
    pub fn new(capacity: usize, observer: Option<Box<dyn NeighborObserver>>) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
            observer,
        }
    }

    /// Forgets every neighbor. No [NeighborEvent::Remove] is reported.
    pub fn clear(&self) {
        let mut slots = self.lock();
        for slot in slots.iter_mut() {
            *slot = None;
        }
        debug!("Neighbor table cleared.");
    }

    /// Admits `id`, or refreshes its link quality if it is already known.
    ///
    /// Returns whether the node was newly admitted. A full table refuses
    /// the node and leaves every existing entry untouched.
    pub fn add(&self, id: NodeId, quality: LinkQuality) -> Result<bool, NeighborError> {
        let mut slots = self.lock();
        if let Some(known) = slots.iter_mut().flatten().find(|n| n.id == id) {
            if known.quality != quality {
                known.quality = quality;
                self.notify(NeighborEvent::Update, id, quality);
            }
            return Ok(false);
        }
        let capacity = slots.len();
        match slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(Neighbor { id, quality });
                info!("New neighbor {:08X} (RSSI {} dBm).", id, quality.rssi);
                self.notify(NeighborEvent::Add, id, quality);
                Ok(true)
            }
            None => Err(NeighborError::TableFull { capacity }),
        }
    }

    /// Returns whether `id` was known.
    pub fn remove(&self, id: NodeId) -> bool {
        let mut slots = self.lock();
        match slots.iter_mut().find(|slot| matches!(slot, Some(n) if n.id == id)) {
            Some(slot) => {
                *slot = None;
                info!("Neighbor {:08X} removed.", id);
                self.notify(NeighborEvent::Remove, id, LinkQuality::default());
                true
            }
            None => false,
        }
    }

    /// Records that a frame was received from `id`, whatever its kind.
    pub fn heard(&self, id: NodeId, quality: LinkQuality) {
        debug!("Overheard frame from {:08X}.", id);
        if let Err(err) = self.add(id, quality) {
            warn!("Neighbor {:08X} not admitted: {}", id, err);
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.lock().iter().flatten().any(|n| n.id == id)
    }

    pub fn get(&self, id: NodeId) -> Option<Neighbor> {
        self.lock().iter().flatten().find(|n| n.id == id).copied()
    }

    /// Snapshot of the known neighbors.
    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.lock().iter().flatten().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    fn notify(&self, event: NeighborEvent, id: NodeId, quality: LinkQuality) {
        if let Some(observer) = &self.observer {
            observer.neighbor_event(event, id, quality);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<Neighbor>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    type Events = Arc<Mutex<Vec<(NeighborEvent, NodeId)>>>;

    fn table(capacity: usize) -> (NeighborTable, Events) {
        let events: Events = Arc::default();
        let sink = events.clone();
        let observer = move |event: NeighborEvent, id: NodeId, _quality: LinkQuality| {
            sink.lock().unwrap().push((event, id))
        };
        (NeighborTable::new(capacity, Some(Box::new(observer))), events)
    }

    fn q(rssi: i16) -> LinkQuality {
        LinkQuality::new(rssi, 5)
    }

    #[test]
    fn add_is_idempotent() {
        let (table, events) = table(4);
        assert_eq!(table.add(1, q(-80)), Ok(true));
        assert_eq!(table.add(1, q(-80)), Ok(false));
        table.heard(1, q(-80));
        assert_eq!(table.len(), 1);
        assert_eq!(*events.lock().unwrap(), vec![(NeighborEvent::Add, 1)]);
    }

    #[test]
    fn quality_change_is_an_update() {
        let (table, events) = table(4);
        table.heard(7, q(-80));
        table.heard(7, q(-60));
        assert_eq!(table.get(7).unwrap().quality, q(-60));
        assert_eq!(
            *events.lock().unwrap(),
            vec![(NeighborEvent::Add, 7), (NeighborEvent::Update, 7)]
        );
    }

    #[test]
    fn full_table_refuses_admission() {
        let (table, events) = table(2);
        table.add(1, q(-70)).unwrap();
        table.add(2, q(-71)).unwrap();
        assert_eq!(table.add(3, q(-72)), Err(NeighborError::TableFull { capacity: 2 }));
        table.heard(4, q(-73));

        let mut ids: Vec<NodeId> = table.neighbors().iter().map(|n| n.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(table.get(1).unwrap().quality, q(-70));
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn remove_frees_a_slot() {
        let (table, events) = table(1);
        table.add(1, q(-70)).unwrap();
        assert!(table.remove(1));
        assert!(!table.remove(1));
        assert_eq!(table.add(2, q(-70)), Ok(true));
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                (NeighborEvent::Add, 1),
                (NeighborEvent::Remove, 1),
                (NeighborEvent::Add, 2)
            ]
        );
    }

    #[test]
    fn clear_is_silent() {
        let (table, events) = table(3);
        table.add(1, q(-70)).unwrap();
        table.add(2, q(-70)).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.capacity(), 3);
        assert_eq!(events.lock().unwrap().len(), 2);
        assert!(!table.contains(1));
    }

    #[test]
    fn shared_between_threads() {
        let (table, events) = table(64);
        let table = Arc::new(table);
        let workers: Vec<_> = (0..4u32)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for i in 0..16u32 {
                        table.heard(t * 16 + i + 1, q(-90));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(table.len(), 64);
        assert_eq!(events.lock().unwrap().len(), 64);
    }
}
