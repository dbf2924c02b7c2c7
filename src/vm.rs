use super::chunk::OpCode;
use super::compiler::{self, CompileMode};
use super::heap::Heap;
use super::natives;
use super::object::{
    raw, GcObject, NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance,
    ObjNative, ObjString, ObjUpvalue, ObjectKind, UpvalueState,
};
use super::table::Table;
use super::value::Value;
use std::io::{self, Write};
use std::ptr;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretError {
    Compile,
    Runtime,
}

struct CallFrame {
    closure: *mut GcObject<ObjClosure>,
    ip: usize,
    slots: usize,
}

/// One interpreter instance: the value stack, call frames, globals, open
/// upvalues and the heap all live here, so independent instances never
/// share state.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: *mut GcObject<ObjUpvalue>,
    init_string: *mut GcObject<ObjString>,
    pub heap: Heap,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Program output (the `print` statement) goes to `out`; diagnostics
    /// always go to stderr.
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: ptr::null_mut(),
            init_string: ptr::null_mut(),
            heap: Heap::new(),
            out,
        };
        vm.define_native("clock", natives::clock);
        vm.define_native("random", natives::random);
        vm.init_string = vm.copy_string("init");
        vm
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        self.run_compiled(source, CompileMode::Script)
    }

    /// Compiles the source as a single expression and prints its value.
    pub fn interpret_expression(&mut self, source: &str) -> Result<(), InterpretError> {
        self.run_compiled(source, CompileMode::Expression)
    }

    fn run_compiled(&mut self, source: &str, mode: CompileMode) -> Result<(), InterpretError> {
        let function = compiler::compile(source, self, mode).ok_or(InterpretError::Compile)?;
        self.push(Value::from(function));
        let closure = self.new_closure(function);
        self.pop();
        self.push(Value::from(closure));
        self.call_closure(closure, 0)?;
        self.run()
    }

    fn run(&mut self) -> Result<(), InterpretError> {
        macro_rules! binary_op {
            ($self:ident, $wrap:path, $op:tt) => {{
                if !$self.peek(0).is_number() || !$self.peek(1).is_number() {
                    return Err($self.runtime_error("Operands must be numbers.".to_string()));
                }
                let b = $self.pop().as_number();
                let a = $self.pop().as_number();
                $self.push($wrap(a $op b));
            }};
        }

        loop {
            #[cfg(feature = "debug-execution")]
            {
                let mut trace = String::from("          ");
                for value in &self.stack {
                    trace += &format!("[ {} ]", value);
                }
                eprintln!("{}", trace);
                let frame = self.frames.last().unwrap();
                let chunk = unsafe { &(*(*frame.closure).data.function).data.chunk };
                eprint!("{}", chunk.disassemble_instruction(frame.ip).0);
            }

            match OpCode::from(self.read_byte()) {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slots;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            let message = format!("Undefined variable '{}'.", unsafe {
                                &(*name).data.chars
                            });
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        // undo the speculative insert before reporting
                        self.globals.delete(name);
                        let message = format!("Undefined variable '{}'.", unsafe {
                            &(*name).data.chars
                        });
                        return Err(self.runtime_error(message));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = unsafe { (&(*self.current_closure()).data.upvalues)[slot] };
                    let value = match unsafe { (*upvalue).data.state } {
                        UpvalueState::Open(index) => self.stack[index],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = unsafe { (&(*self.current_closure()).data.upvalues)[slot] };
                    let value = self.peek(0);
                    unsafe {
                        match (*upvalue).data.state {
                            UpvalueState::Open(index) => self.stack[index] = value,
                            UpvalueState::Closed(_) => {
                                (*upvalue).data.state = UpvalueState::Closed(value)
                            }
                        }
                    }
                }
                OpCode::GetProperty => {
                    if !self.peek(0).is_instance() {
                        return Err(
                            self.runtime_error("Only instances have properties.".to_string())
                        );
                    }
                    let instance = self.peek(0).as_instance();
                    let name = self.read_string();
                    if let Some(value) = unsafe { (*instance).data.fields.get(name) } {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = unsafe { (*instance).data.class };
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    if !self.peek(1).is_instance() {
                        return Err(self.runtime_error("Only instances have fields.".to_string()));
                    }
                    let instance = self.peek(1).as_instance();
                    let name = self.read_string();
                    let value = self.pop();
                    unsafe {
                        (*instance).data.fields.set(name, value);
                    }
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_class();
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b));
                }
                OpCode::Greater => binary_op!(self, Value::Bool, >),
                OpCode::GreaterEqual => binary_op!(self, Value::Bool, >=),
                OpCode::Less => binary_op!(self, Value::Bool, <),
                OpCode::LessEqual => binary_op!(self, Value::Bool, <=),
                OpCode::Add => {
                    if self.peek(0).is_string() && self.peek(1).is_string() {
                        self.concatenate();
                    } else if self.peek(0).is_number() && self.peek(1).is_number() {
                        let b = self.pop().as_number();
                        let a = self.pop().as_number();
                        self.push(Value::Number(a + b));
                    } else {
                        return Err(self.runtime_error(
                            "Operands must be two numbers or two strings.".to_string(),
                        ));
                    }
                }
                OpCode::Subtract => binary_op!(self, Value::Number, -),
                OpCode::Multiply => binary_op!(self, Value::Number, *),
                OpCode::Divide => binary_op!(self, Value::Number, /),
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return Err(self.runtime_error("Operand must be a number.".to_string()));
                    }
                    let value = self.pop().as_number();
                    self.push(Value::Number(-value));
                }
                OpCode::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.out, "{}", value);
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().unwrap().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().unwrap().ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = self.pop().as_class();
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let function = self.read_constant().as_function();
                    let closure = self.new_closure(function);
                    self.push(Value::from(closure));
                    let upvalue_count = unsafe { (*function).data.upvalue_count };
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frames.last().unwrap().slots;
                            self.capture_upvalue(base + index)
                        } else {
                            unsafe { (&(*self.current_closure()).data.upvalues)[index] }
                        };
                        unsafe {
                            (*closure).data.upvalues.push(upvalue);
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.new_class(name);
                    self.push(Value::from(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    if !superclass.is_class() {
                        return Err(self.runtime_error("Superclass must be a class.".to_string()));
                    }
                    let subclass = self.peek(0).as_class();
                    unsafe {
                        let methods = &(*superclass.as_class()).data.methods;
                        (*subclass).data.methods.add_all(methods);
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    self.define_method(name);
                }
            }
        }
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = unsafe { (&(*(*frame.closure).data.function).data.chunk.code)[frame.ip] };
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        high << 8 | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().unwrap();
        unsafe { (&(*(*frame.closure).data.function).data.chunk.constants)[index] }
    }

    fn read_string(&mut self) -> *mut GcObject<ObjString> {
        self.read_constant().as_string()
    }

    fn current_closure(&self) -> *mut GcObject<ObjClosure> {
        self.frames.last().unwrap().closure
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = ptr::null_mut();
    }

    fn runtime_error(&mut self, message: String) -> InterpretError {
        eprintln!("{}", message);
        for frame in self.frames.iter().rev() {
            let function = unsafe { &(*(*frame.closure).data.function).data };
            let line = function.chunk.lines[frame.ip - 1];
            if function.name.is_null() {
                eprintln!("[line {}] in script", line);
            } else {
                eprintln!("[line {}] in {}", line, unsafe {
                    &(*function.name).data.chars
                });
            }
        }
        self.reset_stack();
        InterpretError::Runtime
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), InterpretError> {
        match callee.kind() {
            Some(ObjectKind::Closure) => self.call_closure(callee.as_closure(), arg_count),
            Some(ObjectKind::Native) => {
                let native = unsafe { (*callee.as_native()).data.function };
                let start = self.stack.len() - arg_count;
                match native(&self.stack[start..]) {
                    Ok(result) => {
                        self.stack.truncate(start - 1);
                        self.push(result);
                        Ok(())
                    }
                    Err(message) => Err(self.runtime_error(message)),
                }
            }
            Some(ObjectKind::Class) => {
                let class = callee.as_class();
                let instance = self.new_instance(class);
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = Value::from(instance);
                if let Some(initializer) = unsafe { (*class).data.methods.get(self.init_string) } {
                    self.call_closure(initializer.as_closure(), arg_count)
                } else if arg_count != 0 {
                    Err(self
                        .runtime_error(format!("Expected 0 arguments but got {}.", arg_count)))
                } else {
                    Ok(())
                }
            }
            Some(ObjectKind::BoundMethod) => {
                let bound = callee.as_bound_method();
                let slot = self.stack.len() - arg_count - 1;
                unsafe {
                    self.stack[slot] = (*bound).data.receiver;
                    self.call_closure((*bound).data.method, arg_count)
                }
            }
            _ => Err(self.runtime_error("Can only call functions and classes.".to_string())),
        }
    }

    fn call_closure(
        &mut self,
        closure: *mut GcObject<ObjClosure>,
        arg_count: usize,
    ) -> Result<(), InterpretError> {
        let arity = unsafe { (*(*closure).data.function).data.arity } as usize;
        if arg_count != arity {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow".to_string()));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    /// `GET_PROPERTY` + `CALL` fused: dispatches a method without
    /// materializing a bound method, unless a field shadows it.
    fn invoke(
        &mut self,
        name: *mut GcObject<ObjString>,
        arg_count: usize,
    ) -> Result<(), InterpretError> {
        let receiver = self.peek(arg_count);
        if !receiver.is_instance() {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        }
        let instance = receiver.as_instance();
        if let Some(value) = unsafe { (*instance).data.fields.get(name) } {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }
        let class = unsafe { (*instance).data.class };
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: *mut GcObject<ObjClass>,
        name: *mut GcObject<ObjString>,
        arg_count: usize,
    ) -> Result<(), InterpretError> {
        match unsafe { (*class).data.methods.get(name) } {
            Some(method) => self.call_closure(method.as_closure(), arg_count),
            None => {
                let message =
                    format!("Undefined property '{}'.", unsafe { &(*name).data.chars });
                Err(self.runtime_error(message))
            }
        }
    }

    fn bind_method(
        &mut self,
        class: *mut GcObject<ObjClass>,
        name: *mut GcObject<ObjString>,
    ) -> Result<(), InterpretError> {
        let method = match unsafe { (*class).data.methods.get(name) } {
            Some(method) => method,
            None => {
                let message =
                    format!("Undefined property '{}'.", unsafe { &(*name).data.chars });
                return Err(self.runtime_error(message));
            }
        };
        let bound = self.new_bound_method(self.peek(0), method.as_closure());
        self.pop();
        self.push(Value::from(bound));
        Ok(())
    }

    fn define_method(&mut self, name: *mut GcObject<ObjString>) {
        let method = self.peek(0);
        let class = self.peek(1).as_class();
        unsafe {
            (*class).data.methods.set(name, method);
        }
        self.pop();
    }

    /// Returns the open upvalue for `slot` if one exists, keeping the list
    /// sorted by descending slot; otherwise inserts a fresh cell.
    fn capture_upvalue(&mut self, slot: usize) -> *mut GcObject<ObjUpvalue> {
        let mut previous: *mut GcObject<ObjUpvalue> = ptr::null_mut();
        let mut upvalue = self.open_upvalues;
        unsafe {
            while !upvalue.is_null() && (*upvalue).data.slot().unwrap() > slot {
                previous = upvalue;
                upvalue = (*upvalue).data.next;
            }
            if !upvalue.is_null() && (*upvalue).data.slot() == Some(slot) {
                return upvalue;
            }
        }
        let created = self.new_upvalue(slot);
        unsafe {
            (*created).data.next = upvalue;
            if previous.is_null() {
                self.open_upvalues = created;
            } else {
                (*previous).data.next = created;
            }
        }
        created
    }

    /// Closes every open upvalue at or above `last`, moving the captured
    /// value off the stack into the cell.
    fn close_upvalues(&mut self, last: usize) {
        unsafe {
            while !self.open_upvalues.is_null() {
                let upvalue = self.open_upvalues;
                let slot = match (*upvalue).data.state {
                    UpvalueState::Open(slot) => slot,
                    UpvalueState::Closed(_) => break,
                };
                if slot < last {
                    break;
                }
                (*upvalue).data.state = UpvalueState::Closed(self.stack[slot]);
                self.open_upvalues = (*upvalue).data.next;
                (*upvalue).data.next = ptr::null_mut();
            }
        }
    }

    fn concatenate(&mut self) {
        // operands stay on the stack until the result exists, so a
        // collection triggered by the allocation cannot free them
        let b = self.peek(0).as_string();
        let a = self.peek(1).as_string();
        let mut chars = unsafe { (*a).data.chars.clone() };
        chars.push_str(unsafe { &(*b).data.chars });
        let result = self.take_string(chars);
        self.pop();
        self.pop();
        self.push(Value::from(result));
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.copy_string(name);
        self.push(Value::from(name));
        let native = self.new_native(function);
        self.push(Value::from(native));
        self.globals.set(self.stack[0].as_string(), self.stack[1]);
        self.pop();
        self.pop();
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    pub fn collect_garbage(&mut self) {
        #[cfg(feature = "log-gc")]
        let before = self.heap.bytes_allocated();
        #[cfg(feature = "log-gc")]
        eprintln!("-- gc begin");

        for index in 0..self.stack.len() {
            let value = self.stack[index];
            self.heap.mark_value(value);
        }
        for index in 0..self.frames.len() {
            let closure = self.frames[index].closure;
            self.heap.mark_object(raw(closure));
        }
        let mut upvalue = self.open_upvalues;
        while !upvalue.is_null() {
            self.heap.mark_object(raw(upvalue));
            upvalue = unsafe { (*upvalue).data.next };
        }
        self.heap.mark_table(&self.globals);
        self.heap.mark_object(raw(self.init_string));
        self.heap.mark_temp_roots();

        self.heap.trace_references();
        // the intern table is weak: unreachable strings drop out before the
        // sweep would free them
        self.heap.strings.remove_white();
        self.heap.sweep();

        #[cfg(feature = "log-gc")]
        eprintln!(
            "-- gc end ({} -> {} bytes)",
            before,
            self.heap.bytes_allocated()
        );
    }

    pub fn copy_string(&mut self, chars: &str) -> *mut GcObject<ObjString> {
        self.maybe_collect();
        self.heap.copy_string(chars)
    }

    pub fn take_string(&mut self, chars: String) -> *mut GcObject<ObjString> {
        self.maybe_collect();
        self.heap.take_string(chars)
    }

    pub fn new_function(&mut self) -> *mut GcObject<ObjFunction> {
        self.maybe_collect();
        self.heap.new_function()
    }

    fn new_native(&mut self, function: NativeFn) -> *mut GcObject<ObjNative> {
        self.maybe_collect();
        self.heap.new_native(function)
    }

    fn new_upvalue(&mut self, slot: usize) -> *mut GcObject<ObjUpvalue> {
        self.maybe_collect();
        self.heap.new_upvalue(slot)
    }

    fn new_closure(&mut self, function: *mut GcObject<ObjFunction>) -> *mut GcObject<ObjClosure> {
        self.maybe_collect();
        self.heap.new_closure(function)
    }

    fn new_class(&mut self, name: *mut GcObject<ObjString>) -> *mut GcObject<ObjClass> {
        self.maybe_collect();
        self.heap.new_class(name)
    }

    fn new_instance(&mut self, class: *mut GcObject<ObjClass>) -> *mut GcObject<ObjInstance> {
        self.maybe_collect();
        self.heap.new_instance(class)
    }

    fn new_bound_method(
        &mut self,
        receiver: Value,
        method: *mut GcObject<ObjClosure>,
    ) -> *mut GcObject<ObjBoundMethod> {
        self.maybe_collect();
        self.heap.new_bound_method(receiver, method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::hash_string;

    #[test]
    fn stack_values_survive_collection() {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        let string = vm.copy_string("rooted");
        vm.push(Value::from(string));
        vm.collect_garbage();
        assert_eq!(
            vm.heap.strings.find_string("rooted", hash_string("rooted")),
            Some(string)
        );
        vm.pop();
        vm.collect_garbage();
        assert_eq!(
            vm.heap.strings.find_string("rooted", hash_string("rooted")),
            None
        );
    }

    #[test]
    fn globals_survive_collection_between_runs() {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        vm.interpret("var greeting = \"hello\";").unwrap();
        vm.collect_garbage();
        assert!(vm.interpret("var copy = greeting + \" world\";").is_ok());
    }

    #[test]
    fn init_string_is_a_root() {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        vm.collect_garbage();
        assert_eq!(
            vm.heap.strings.find_string("init", hash_string("init")),
            Some(vm.init_string)
        );
    }

    #[test]
    fn runtime_error_resets_the_stack() {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        assert_eq!(vm.interpret("print 1 + nil;"), Err(InterpretError::Runtime));
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        // the instance stays usable, REPL-style
        assert!(vm.interpret("print 1 + 2;").is_ok());
    }

    #[test]
    fn compile_error_is_reported_before_execution() {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        assert_eq!(vm.interpret("var 1 = 2;"), Err(InterpretError::Compile));
    }

    #[test]
    fn deep_recursion_overflows() {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        assert_eq!(
            vm.interpret("fun loop() { loop(); } loop();"),
            Err(InterpretError::Runtime)
        );
    }

    #[test]
    fn natives_are_callable() {
        let mut vm = Vm::with_output(Box::new(io::sink()));
        assert!(vm.interpret("var t = clock(); var r = random();").is_ok());
    }
}
