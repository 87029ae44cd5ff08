mod object;
mod registry;
mod tracer;
mod value;

pub use object::{HeapObject, ObjectKind, RefObject};
pub use registry::Heap;
pub use tracer::{
    trace, HeapSnapshot, HeapTracer, IncomingRef, LeakCandidate, LeakReport, Root, TracedObject,
    TypeStats, CYCLE_PATH,
};
pub use value::{ObjectRef, Value};
