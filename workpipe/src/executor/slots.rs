//! Slot arena: per-kind occupancy tracking with generation-checked handles.

use serde::{Deserialize, Serialize};

/// Kind of execution slot a stage occupies while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Process,
    Thread,
}

/// Opaque reference to an occupied slot.
///
/// The generation changes every time a slot is released, so a handle that
/// outlives its occupancy (double release, release after pool reset) is
/// detected instead of freeing someone else's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    kind: SlotKind,
    index: u32,
    generation: u32,
}

impl SlotHandle {
    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Default, Clone)]
struct Slot {
    generation: u32,
    occupied: bool,
}

#[derive(Debug)]
pub(crate) struct SlotArena {
    process: Vec<Slot>,
    thread: Vec<Slot>,
    process_peak: usize,
    thread_peak: usize,
    pub(crate) closed: bool,
}

impl SlotArena {
    pub(crate) fn new(process_slots: usize, thread_slots: usize) -> Self {
        Self {
            process: vec![Slot::default(); process_slots],
            thread: vec![Slot::default(); thread_slots],
            process_peak: 0,
            thread_peak: 0,
            closed: false,
        }
    }

    fn slots(&self, kind: SlotKind) -> &Vec<Slot> {
        match kind {
            SlotKind::Process => &self.process,
            SlotKind::Thread => &self.thread,
        }
    }

    fn slots_mut(&mut self, kind: SlotKind) -> &mut Vec<Slot> {
        match kind {
            SlotKind::Process => &mut self.process,
            SlotKind::Thread => &mut self.thread,
        }
    }

    pub(crate) fn capacity(&self, kind: SlotKind) -> usize {
        self.slots(kind).len()
    }

    pub(crate) fn occupied(&self, kind: SlotKind) -> usize {
        self.slots(kind).iter().filter(|s| s.occupied).count()
    }

    pub(crate) fn peak(&self, kind: SlotKind) -> usize {
        match kind {
            SlotKind::Process => self.process_peak,
            SlotKind::Thread => self.thread_peak,
        }
    }

    pub(crate) fn try_acquire(&mut self, kind: SlotKind) -> Option<SlotHandle> {
        let slots = self.slots_mut(kind);
        let index = slots.iter().position(|s| !s.occupied)?;
        slots[index].occupied = true;
        let handle = SlotHandle {
            kind,
            index: index as u32,
            generation: slots[index].generation,
        };
        self.update_peak(kind);
        Some(handle)
    }

    /// Acquire one slot per entry in `kinds`, or none at all.
    pub(crate) fn try_acquire_all(&mut self, kinds: &[SlotKind]) -> Option<Vec<SlotHandle>> {
        for kind in [SlotKind::Process, SlotKind::Thread] {
            let wanted = kinds.iter().filter(|k| **k == kind).count();
            let free = self.capacity(kind) - self.occupied(kind);
            if wanted > free {
                return None;
            }
        }
        kinds.iter().map(|kind| self.try_acquire(*kind)).collect()
    }

    /// Release a slot. Returns `false` if the handle is stale or unknown.
    pub(crate) fn release(&mut self, handle: SlotHandle) -> bool {
        let Some(slot) = self.slots_mut(handle.kind).get_mut(handle.index as usize) else {
            return false;
        };
        if !slot.occupied || slot.generation != handle.generation {
            return false;
        }
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        true
    }

    fn update_peak(&mut self, kind: SlotKind) {
        let occupied = self.occupied(kind);
        let peak = match kind {
            SlotKind::Process => &mut self.process_peak,
            SlotKind::Thread => &mut self.thread_peak,
        };
        *peak = (*peak).max(occupied);
    }
}
