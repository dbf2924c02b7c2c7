use super::object::{
    hash_string, raw, GcObject, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance,
    ObjNative, ObjString, ObjUpvalue, ObjectKind, NativeFn, UpvalueState, RawObject,
};
use super::table::Table;
use super::value::Value;
use std::mem;
use std::ptr;

const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// Owns every heap object. Objects live in an intrusive singly-linked list
/// threaded through their headers; the intern table holds every live string
/// weakly. The heap tracks bytes and decides *when* a collection is due, but
/// the owner that can enumerate roots drives the phases.
pub struct Heap {
    objects: RawObject,
    pub strings: Table,
    gray_stack: Vec<RawObject>,
    bytes_allocated: usize,
    next_gc: usize,
    temp_roots: Vec<Value>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: ptr::null_mut(),
            strings: Table::new(),
            gray_stack: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            temp_roots: Vec::new(),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// True when the next allocation should run a collection first.
    pub fn should_collect(&self) -> bool {
        if cfg!(feature = "stress-gc") {
            return true;
        }
        self.bytes_allocated > self.next_gc
    }

    /// Anchor for values that would otherwise only be reachable from a Rust
    /// local across an allocation.
    pub fn push_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_root(&mut self) {
        self.temp_roots.pop();
    }

    fn allocate<T>(&mut self, data: T, kind: ObjectKind, extra: usize) -> *mut GcObject<T> {
        let size = mem::size_of::<GcObject<T>>() + extra;
        let object = Box::into_raw(Box::new(GcObject {
            kind,
            marked: false,
            next: self.objects,
            size,
            data,
        }));
        self.objects = raw(object);
        self.bytes_allocated += size;
        #[cfg(feature = "log-gc")]
        eprintln!("{:p} allocate {} for {:?}", object, size, kind);
        object
    }

    /// Interns a copy of `chars`, returning the canonical string object.
    pub fn copy_string(&mut self, chars: &str) -> *mut GcObject<ObjString> {
        let hash = hash_string(chars);
        if let Some(interned) = self.strings.find_string(chars, hash) {
            return interned;
        }
        self.intern(chars.to_string(), hash)
    }

    /// Interns an owned buffer, dropping it when an equal string exists.
    pub fn take_string(&mut self, chars: String) -> *mut GcObject<ObjString> {
        let hash = hash_string(&chars);
        if let Some(interned) = self.strings.find_string(&chars, hash) {
            return interned;
        }
        self.intern(chars, hash)
    }

    fn intern(&mut self, chars: String, hash: u32) -> *mut GcObject<ObjString> {
        let extra = chars.capacity();
        let string = self.allocate(ObjString { chars, hash }, ObjectKind::String, extra);
        self.strings.set(string, Value::Nil);
        string
    }

    pub fn new_function(&mut self) -> *mut GcObject<ObjFunction> {
        self.allocate(ObjFunction::new(), ObjectKind::Function, 0)
    }

    pub fn new_native(&mut self, function: NativeFn) -> *mut GcObject<ObjNative> {
        self.allocate(ObjNative { function }, ObjectKind::Native, 0)
    }

    pub fn new_upvalue(&mut self, slot: usize) -> *mut GcObject<ObjUpvalue> {
        self.allocate(
            ObjUpvalue {
                state: UpvalueState::Open(slot),
                next: ptr::null_mut(),
            },
            ObjectKind::Upvalue,
            0,
        )
    }

    pub fn new_closure(&mut self, function: *mut GcObject<ObjFunction>) -> *mut GcObject<ObjClosure> {
        let upvalue_count = unsafe { (*function).data.upvalue_count };
        let extra = upvalue_count * mem::size_of::<*mut GcObject<ObjUpvalue>>();
        self.allocate(
            ObjClosure {
                function,
                upvalues: Vec::with_capacity(upvalue_count),
            },
            ObjectKind::Closure,
            extra,
        )
    }

    pub fn new_class(&mut self, name: *mut GcObject<ObjString>) -> *mut GcObject<ObjClass> {
        self.allocate(
            ObjClass {
                name,
                methods: Table::new(),
            },
            ObjectKind::Class,
            0,
        )
    }

    pub fn new_instance(&mut self, class: *mut GcObject<ObjClass>) -> *mut GcObject<ObjInstance> {
        self.allocate(
            ObjInstance {
                class,
                fields: Table::new(),
            },
            ObjectKind::Instance,
            0,
        )
    }

    pub fn new_bound_method(
        &mut self,
        receiver: Value,
        method: *mut GcObject<ObjClosure>,
    ) -> *mut GcObject<ObjBoundMethod> {
        self.allocate(
            ObjBoundMethod { receiver, method },
            ObjectKind::BoundMethod,
            0,
        )
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Object(object) = value {
            self.mark_object(object);
        }
    }

    pub fn mark_object(&mut self, object: RawObject) {
        if object.is_null() {
            return;
        }
        unsafe {
            if (*object).marked {
                return;
            }
            (*object).marked = true;
        }
        #[cfg(feature = "log-gc")]
        eprintln!("{:p} mark {}", object, Value::Object(object));
        self.gray_stack.push(object);
    }

    pub fn mark_table(&mut self, table: &Table) {
        for entry in table.entries() {
            self.mark_object(raw(entry.key));
            self.mark_value(entry.value);
        }
    }

    pub fn mark_temp_roots(&mut self) {
        for index in 0..self.temp_roots.len() {
            let value = self.temp_roots[index];
            self.mark_value(value);
        }
    }

    /// Drains the gray worklist, marking each object's children, until every
    /// reachable object is black.
    pub fn trace_references(&mut self) {
        while let Some(object) = self.gray_stack.pop() {
            self.blacken(object);
        }
    }

    fn blacken(&mut self, object: RawObject) {
        #[cfg(feature = "log-gc")]
        eprintln!("{:p} blacken {}", object, Value::Object(object));
        unsafe {
            match (*object).kind {
                ObjectKind::String | ObjectKind::Native => {}
                ObjectKind::Upvalue => {
                    let upvalue = object as *mut GcObject<ObjUpvalue>;
                    if let UpvalueState::Closed(value) = (*upvalue).data.state {
                        self.mark_value(value);
                    }
                }
                ObjectKind::Function => {
                    let function = object as *mut GcObject<ObjFunction>;
                    self.mark_object(raw((*function).data.name));
                    for index in 0..(*function).data.chunk.constants.len() {
                        let constant = (&(*function).data.chunk.constants)[index];
                        self.mark_value(constant);
                    }
                }
                ObjectKind::Closure => {
                    let closure = object as *mut GcObject<ObjClosure>;
                    self.mark_object(raw((*closure).data.function));
                    for index in 0..(*closure).data.upvalues.len() {
                        let upvalue = (&(*closure).data.upvalues)[index];
                        self.mark_object(raw(upvalue));
                    }
                }
                ObjectKind::Class => {
                    let class = object as *mut GcObject<ObjClass>;
                    self.mark_object(raw((*class).data.name));
                    self.mark_table(&(*class).data.methods);
                }
                ObjectKind::Instance => {
                    let instance = object as *mut GcObject<ObjInstance>;
                    self.mark_object(raw((*instance).data.class));
                    self.mark_table(&(*instance).data.fields);
                }
                ObjectKind::BoundMethod => {
                    let bound = object as *mut GcObject<ObjBoundMethod>;
                    self.mark_value((*bound).data.receiver);
                    self.mark_object(raw((*bound).data.method));
                }
            }
        }
    }

    /// Frees every unmarked object and clears the mark bit on survivors.
    /// The intern table must have been weak-swept first.
    pub fn sweep(&mut self) {
        let mut previous: RawObject = ptr::null_mut();
        let mut object = self.objects;
        while !object.is_null() {
            unsafe {
                if (*object).marked {
                    (*object).marked = false;
                    previous = object;
                    object = (*object).next;
                } else {
                    let unreached = object;
                    object = (*object).next;
                    if previous.is_null() {
                        self.objects = object;
                    } else {
                        (*previous).next = object;
                    }
                    self.free_object(unreached);
                }
            }
        }
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
    }

    unsafe fn free_object(&mut self, object: RawObject) {
        self.bytes_allocated -= (*object).size;
        #[cfg(feature = "log-gc")]
        eprintln!("{:p} free {:?}", object, (*object).kind);
        match (*object).kind {
            ObjectKind::String => drop(Box::from_raw(object as *mut GcObject<ObjString>)),
            ObjectKind::Function => drop(Box::from_raw(object as *mut GcObject<ObjFunction>)),
            ObjectKind::Native => drop(Box::from_raw(object as *mut GcObject<ObjNative>)),
            ObjectKind::Upvalue => drop(Box::from_raw(object as *mut GcObject<ObjUpvalue>)),
            ObjectKind::Closure => drop(Box::from_raw(object as *mut GcObject<ObjClosure>)),
            ObjectKind::Class => drop(Box::from_raw(object as *mut GcObject<ObjClass>)),
            ObjectKind::Instance => drop(Box::from_raw(object as *mut GcObject<ObjInstance>)),
            ObjectKind::BoundMethod => {
                drop(Box::from_raw(object as *mut GcObject<ObjBoundMethod>))
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut object = self.objects;
        while !object.is_null() {
            unsafe {
                let next = (*object).next;
                self.free_object(object);
                object = next;
            }
        }
        self.objects = ptr::null_mut();
    }
}
