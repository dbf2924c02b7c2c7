use super::chunk::Chunk;
use super::table::Table;
use super::value::Value;

/// Discriminant stored in every object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    String,
    Function,
    Native,
    Upvalue,
    Closure,
    Class,
    Instance,
    BoundMethod,
}

/// Zero-sized payload used to view any heap object through its header alone.
pub struct Header;

/// A heap object viewed through its header, with the payload type erased.
pub type RawObject = *mut GcObject<Header>;

/// Common header plus payload. `#[repr(C)]` keeps the header fields at the
/// same offsets for every payload type, so a `*mut GcObject<T>` can be read
/// as a `RawObject` and cast back once `kind` has been checked.
#[repr(C)]
pub struct GcObject<T> {
    pub kind: ObjectKind,
    pub marked: bool,
    pub next: RawObject,
    pub size: usize,
    pub data: T,
}

pub fn raw<T>(object: *mut GcObject<T>) -> RawObject {
    object as RawObject
}

/// 32-bit FNV-1a over the raw bytes.
pub fn hash_string(chars: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in chars.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Immutable interned string. Two live strings with equal bytes are always
/// the same object.
pub struct ObjString {
    pub chars: String,
    pub hash: u32,
}

/// Compiled function prototype. Immutable once compilation finishes; only
/// callable when wrapped in a closure.
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: *mut GcObject<ObjString>,
}

impl ObjFunction {
    pub fn new() -> Self {
        Self {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: std::ptr::null_mut(),
        }
    }
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

pub struct ObjNative {
    pub function: NativeFn,
}

/// A captured variable cell: `Open` while the variable still lives on the
/// VM stack, `Closed` once it owns the value. Open cells are threaded in a
/// list sorted by descending stack slot.
#[derive(Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct ObjUpvalue {
    pub state: UpvalueState,
    pub next: *mut GcObject<ObjUpvalue>,
}

impl ObjUpvalue {
    pub fn slot(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }
}

pub struct ObjClosure {
    pub function: *mut GcObject<ObjFunction>,
    pub upvalues: Vec<*mut GcObject<ObjUpvalue>>,
}

pub struct ObjClass {
    pub name: *mut GcObject<ObjString>,
    pub methods: Table,
}

pub struct ObjInstance {
    pub class: *mut GcObject<ObjClass>,
    pub fields: Table,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: *mut GcObject<ObjClosure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(hash_string(""), 2166136261);
        assert_eq!(hash_string("a"), 0xe40c292c);
        assert_eq!(hash_string("foobar"), 0xbf9cf968);
    }
}
