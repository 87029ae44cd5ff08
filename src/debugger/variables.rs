use std::cell::OnceCell;
use std::collections::HashMap;

use crate::dap::VariableInfo;
use crate::heap::{Heap, ObjectRef, RefObject, Value};

struct Container {
    object: ObjectRef,
    listing: OnceCell<Vec<VariableInfo>>,
}

/// Expandable object views handed to the debugger while paused.
///
/// References are allocated on first sight of an object and its children are
/// listed only when asked for, once. Everything is dropped on resume.
#[derive(Default)]
pub struct VariableStore {
    next: u32,
    containers: HashMap<u32, Container>,
    by_object: HashMap<ObjectRef, u32>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn reference_for(&mut self, object: ObjectRef) -> u32 {
        if let Some(&id) = self.by_object.get(&object) {
            return id;
        }
        self.next += 1;
        let id = self.next;
        self.by_object.insert(object, id);
        self.containers.insert(
            id,
            Container {
                object,
                listing: OnceCell::new(),
            },
        );
        id
    }

    pub fn describe(&mut self, heap: &Heap, name: &str, value: &Value) -> VariableInfo {
        match value {
            Value::Ref(r) => match heap.get(*r) {
                Some(obj) => VariableInfo {
                    name: name.to_string(),
                    value: obj.describe(),
                    type_name: obj.gc_key(),
                    variables_reference: self.reference_for(*r),
                },
                None => VariableInfo {
                    name: name.to_string(),
                    value: "(destroyed)".to_string(),
                    type_name: "object".to_string(),
                    variables_reference: 0,
                },
            },
            Value::Str(s) => VariableInfo {
                name: name.to_string(),
                value: format!("{s:?}"),
                type_name: value.type_name().to_string(),
                variables_reference: 0,
            },
            other => VariableInfo {
                name: name.to_string(),
                value: other.to_string(),
                type_name: other.type_name().to_string(),
                variables_reference: 0,
            },
        }
    }

    /// Children of `reference`, restricted to `fields` when given.
    pub fn expand(
        &mut self,
        heap: &Heap,
        reference: u32,
        fields: Option<&[String]>,
    ) -> Option<Vec<VariableInfo>> {
        let (object, cached) = {
            let container = self.containers.get(&reference)?;
            (container.object, container.listing.get().cloned())
        };
        let listing = match cached {
            Some(listing) => listing,
            None => {
                let mut children = Vec::new();
                if let Some(obj) = heap.get(object) {
                    obj.scan(&mut |name, value| children.push((name.to_string(), value.clone())));
                }
                let listing: Vec<VariableInfo> = children
                    .iter()
                    .map(|(name, value)| self.describe(heap, name, value))
                    .collect();
                if let Some(container) = self.containers.get(&reference) {
                    let _ = container.listing.set(listing.clone());
                }
                listing
            }
        };

        Some(match fields {
            Some(wanted) => listing
                .into_iter()
                .filter(|v| wanted.iter().any(|f| *f == v.name))
                .collect(),
            None => listing,
        })
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn clear(&mut self) {
        self.containers.clear();
        self.by_object.clear();
    }
}
