use super::object::{HeapObject, ObjectKind};
use super::value::ObjectRef;

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    object: Option<HeapObject>,
}

/// Arena of heap objects. Slots are recycled; ids are not.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_id: u64,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_id: 1,
        }
    }

    pub fn alloc(&mut self, kind: ObjectKind) -> ObjectRef {
        let id = self.next_id;
        self.next_id += 1;
        let object = HeapObject::new(id, kind);

        match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.object = Some(object);
                ObjectRef {
                    slot,
                    generation: entry.generation,
                }
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    object: Some(object),
                });
                ObjectRef {
                    slot,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, r: ObjectRef) -> Option<&HeapObject> {
        let slot = self.slots.get(r.slot as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.object.as_ref()
    }

    pub fn get_mut(&mut self, r: ObjectRef) -> Option<&mut HeapObject> {
        let slot = self.slots.get_mut(r.slot as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.object.as_mut()
    }

    /// Clear the object's edges and free its slot. Returns the retired id.
    pub fn destroy(&mut self, r: ObjectRef) -> Option<u64> {
        let slot = self.slots.get_mut(r.slot as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        let mut object = slot.object.take()?;
        object.destroy();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(r.slot);
        Some(object.id)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.object.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectRef, &HeapObject)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.object.as_ref().map(|obj| {
                (
                    ObjectRef {
                        slot: i as u32,
                        generation: slot.generation,
                    },
                    obj,
                )
            })
        })
    }
}
