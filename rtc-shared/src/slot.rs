
use std::fmt;

/// Handle into a [SlotTable]: the slot index plus the generation the slot had when the
/// handle was issued. A handle outlives a slot reuse without aliasing the new occupant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotHandle {
    index: usize,
    generation: u32,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity arena with generational handles.
pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    next: usize,
}

impl<T> SlotTable<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    generation: 0,
                    value: None,
                })
                .collect(),
            next: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `value` in the first empty slot at or after the round-robin cursor.
    /// Returns the value back when the table is full.
    pub fn insert(&mut self, value: T) -> Result<SlotHandle, T> {
        let capacity = self.slots.len();
        for i in 0..capacity {
            let index = (self.next + i) % capacity;
            if self.slots[index].value.is_none() {
                self.next = (index + 1) % capacity;
                return Ok(self.occupy(index, value));
            }
        }
        Err(value)
    }

    /// Stores `value` at `index`, evicting any current occupant. The slot generation is
    /// bumped so that handles to the evicted value stop resolving.
    pub fn replace(&mut self, index: usize, value: T) -> Option<(SlotHandle, Option<T>)> {
        let slot = self.slots.get_mut(index)?;
        let evicted = slot.value.take();
        if evicted.is_some() {
            slot.generation = slot.generation.wrapping_add(1);
        }
        Some((self.occupy(index, value), evicted))
    }

    fn occupy(&mut self, index: usize, value: T) -> SlotHandle {
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        SlotHandle {
            index,
            generation: slot.generation,
        }
    }

    pub fn contains(&self, handle: SlotHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation == handle.generation {
            slot.value.as_ref()
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation == handle.generation {
            slot.value.as_mut()
        } else {
            None
        }
    }

    /// Resolves the current occupant of `index`, as when an index arrives off the wire.
    pub fn handle_at(&self, index: usize) -> Option<SlotHandle> {
        let slot = self.slots.get(index)?;
        slot.value.as_ref().map(|_| SlotHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Empties the slot and invalidates every outstanding handle to it.
    pub fn remove(&mut self, handle: SlotHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take();
        if value.is_some() {
            slot.generation = slot.generation.wrapping_add(1);
        }
        value
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|v| {
                (
                    SlotHandle {
                        index,
                        generation: slot.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlotHandle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|v| (SlotHandle { index, generation }, v))
        })
    }

    pub fn handles(&self) -> Vec<SlotHandle> {
        self.iter().map(|(h, _)| h).collect()
    }
}
