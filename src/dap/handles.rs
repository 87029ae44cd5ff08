use std::cell::OnceCell;
use std::collections::HashMap;

use serde_json::{json, Value};

use super::protocol::VariableInfo;
use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Locals,
    Captures,
    Globals,
}

impl ScopeKind {
    pub fn label(self) -> &'static str {
        match self {
            ScopeKind::Locals => "Locals",
            ScopeKind::Captures => "Closure",
            ScopeKind::Globals => "Globals",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    /// A scope of the `frame`-th frame of the current stop.
    Scope { frame: usize, kind: ScopeKind },
    /// An expandable value living on the engine side.
    Remote(u32),
}

struct Entry {
    handle: Handle,
    listing: OnceCell<Vec<Value>>,
}

/// DAP-side ids for frames, scopes and variables of the current stop.
///
/// Ids only become valid once their parent was fetched: frames by
/// `stackTrace`, scopes by `scopes`, children by `variables`.
#[derive(Default)]
pub struct Handles {
    next: i64,
    frames: Option<usize>,
    entries: HashMap<i64, Entry>,
    ids: HashMap<Handle, i64>,
}

impl Handles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.frames = None;
        self.entries.clear();
        self.ids.clear();
    }

    pub fn frames_fetched(&mut self, count: usize) {
        self.frames = Some(count);
    }

    /// DAP frame ids are 1-based positions in the last `stackTrace` answer.
    pub fn frame_index(&self, frame_id: i64) -> Result<usize, ProtocolError> {
        match self.frames {
            Some(count) if frame_id >= 1 && (frame_id as usize) <= count => {
                Ok(frame_id as usize - 1)
            }
            _ => Err(ProtocolError::InvalidReference(frame_id)),
        }
    }

    pub fn alloc(&mut self, handle: Handle) -> i64 {
        if let Some(&id) = self.ids.get(&handle) {
            return id;
        }
        self.next += 1;
        let id = self.next;
        self.ids.insert(handle, id);
        self.entries.insert(
            id,
            Entry {
                handle,
                listing: OnceCell::new(),
            },
        );
        id
    }

    pub fn get(&self, id: i64) -> Result<Handle, ProtocolError> {
        self.entries
            .get(&id)
            .map(|e| e.handle)
            .ok_or(ProtocolError::InvalidReference(id))
    }

    pub fn cached(&self, id: i64) -> Option<&Vec<Value>> {
        self.entries.get(&id)?.listing.get()
    }

    pub fn memoize(&mut self, id: i64, listing: Vec<Value>) {
        if let Some(entry) = self.entries.get(&id) {
            let _ = entry.listing.set(listing);
        }
    }

    /// DAP `Variable` for an engine-side description, allocating a child
    /// handle when the value is expandable.
    pub fn variable(&mut self, info: &VariableInfo) -> Value {
        let reference = match info.variables_reference {
            0 => 0,
            remote => self.alloc(Handle::Remote(remote)),
        };
        json!({
            "name": info.name,
            "value": info.value,
            "type": info.type_name,
            "variablesReference": reference,
        })
    }
}
