use std::collections::BTreeMap;

use super::value::Value;

/// Capabilities every traced heap entity provides.
pub trait RefObject {
    /// Visit each direct outgoing edge as `(field name, value)`.
    fn scan(&self, visit: &mut dyn FnMut(&str, &Value));
    /// Grouping key for per-type statistics.
    fn gc_key(&self) -> String;
    /// Approximate size in abstract units.
    fn gc_size(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    Record {
        type_name: String,
        fields: BTreeMap<String, Value>,
    },
    /// A closure: function index plus captured values.
    Action {
        function: usize,
        name: String,
        captures: Vec<Value>,
    },
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Buffer(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeapObject {
    /// Registry id, never reused. 0 means "not tracked".
    pub id: u64,
    pub kind: ObjectKind,
    destroyed: bool,
}

impl HeapObject {
    pub fn new(id: u64, kind: ObjectKind) -> Self {
        Self {
            id,
            kind,
            destroyed: false,
        }
    }

    /// Drop every outgoing edge. The id stays valid for reporting.
    pub fn destroy(&mut self) {
        match &mut self.kind {
            ObjectKind::Record { fields, .. } | ObjectKind::Map(fields) => fields.clear(),
            ObjectKind::Action { captures, .. } => captures.clear(),
            ObjectKind::Array(items) => items.clear(),
            ObjectKind::Buffer(bytes) => bytes.clear(),
        }
        self.destroyed = true;
    }

    /// Field lookup, polymorphic over records and maps.
    pub fn get_field(&self, name: &str) -> Result<Value, String> {
        match &self.kind {
            ObjectKind::Record { fields, .. } | ObjectKind::Map(fields) => {
                Ok(fields.get(name).cloned().unwrap_or_default())
            }
            ObjectKind::Array(items) if name == "length" => Ok(Value::Number(items.len() as f64)),
            ObjectKind::Buffer(bytes) if name == "length" => Ok(Value::Number(bytes.len() as f64)),
            _ => Err(format!("cannot read field `{name}` of {}", self.gc_key())),
        }
    }

    pub fn set_field(&mut self, name: &str, value: Value) -> Result<(), String> {
        match &mut self.kind {
            ObjectKind::Record { fields, .. } | ObjectKind::Map(fields) => {
                fields.insert(name.to_string(), value);
                Ok(())
            }
            _ => Err(format!("cannot write field `{name}` of {}", self.gc_key())),
        }
    }

    /// Short human-readable summary used by the debugger.
    pub fn describe(&self) -> String {
        match &self.kind {
            ObjectKind::Record { type_name, .. } => type_name.clone(),
            ObjectKind::Action { name, .. } => format!("function {name}"),
            ObjectKind::Array(items) => format!("Array({})", items.len()),
            ObjectKind::Map(fields) => format!("Map({})", fields.len()),
            ObjectKind::Buffer(bytes) => format!("Buffer({})", bytes.len()),
        }
    }
}

impl RefObject for HeapObject {
    fn scan(&self, visit: &mut dyn FnMut(&str, &Value)) {
        if self.destroyed {
            return;
        }
        match &self.kind {
            ObjectKind::Record { fields, .. } | ObjectKind::Map(fields) => {
                for (name, value) in fields {
                    visit(name, value);
                }
            }
            ObjectKind::Action { captures, .. } => {
                for (i, value) in captures.iter().enumerate() {
                    visit(&format!("capture{i}"), value);
                }
            }
            ObjectKind::Array(items) => {
                for (i, value) in items.iter().enumerate() {
                    visit(&format!("[{i}]"), value);
                }
            }
            ObjectKind::Buffer(_) => {}
        }
    }

    fn gc_key(&self) -> String {
        match &self.kind {
            ObjectKind::Record { type_name, .. } => type_name.clone(),
            ObjectKind::Action { name, .. } => format!("(action {name})"),
            ObjectKind::Array(_) => "(array)".to_string(),
            ObjectKind::Map(_) => "(map)".to_string(),
            ObjectKind::Buffer(_) => "(buffer)".to_string(),
        }
    }

    fn gc_size(&self) -> usize {
        match &self.kind {
            ObjectKind::Record { fields, .. } => 2 + fields.len(),
            ObjectKind::Action { captures, .. } => 2 + captures.len(),
            ObjectKind::Array(items) => 2 + items.len(),
            ObjectKind::Map(fields) => 2 + 2 * fields.len(),
            ObjectKind::Buffer(bytes) => 2 + bytes.len().div_ceil(4),
        }
    }
}
