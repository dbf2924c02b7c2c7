use super::value::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Constant,
    Nil,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    GetProperty,
    SetProperty,
    GetSuper,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    CloseUpvalue,
    Return,
    Class,
    Inherit,
    Method,
}

impl From<u8> for OpCode {
    fn from(byte: u8) -> Self {
        match byte {
            0 => OpCode::Constant,
            1 => OpCode::Nil,
            2 => OpCode::True,
            3 => OpCode::False,
            4 => OpCode::Pop,
            5 => OpCode::GetLocal,
            6 => OpCode::SetLocal,
            7 => OpCode::GetGlobal,
            8 => OpCode::DefineGlobal,
            9 => OpCode::SetGlobal,
            10 => OpCode::GetUpvalue,
            11 => OpCode::SetUpvalue,
            12 => OpCode::GetProperty,
            13 => OpCode::SetProperty,
            14 => OpCode::GetSuper,
            15 => OpCode::Equal,
            16 => OpCode::NotEqual,
            17 => OpCode::Greater,
            18 => OpCode::GreaterEqual,
            19 => OpCode::Less,
            20 => OpCode::LessEqual,
            21 => OpCode::Add,
            22 => OpCode::Subtract,
            23 => OpCode::Multiply,
            24 => OpCode::Divide,
            25 => OpCode::Not,
            26 => OpCode::Negate,
            27 => OpCode::Print,
            28 => OpCode::Jump,
            29 => OpCode::JumpIfFalse,
            30 => OpCode::Loop,
            31 => OpCode::Call,
            32 => OpCode::Invoke,
            33 => OpCode::SuperInvoke,
            34 => OpCode::Closure,
            35 => OpCode::CloseUpvalue,
            36 => OpCode::Return,
            37 => OpCode::Class,
            38 => OpCode::Inherit,
            39 => OpCode::Method,
            _ => unreachable!("unknown opcode {}", byte),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OpCode::Constant => "CONSTANT",
            OpCode::Nil => "NIL",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::Pop => "POP",
            OpCode::GetLocal => "GET_LOCAL",
            OpCode::SetLocal => "SET_LOCAL",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::DefineGlobal => "DEFINE_GLOBAL",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::GetUpvalue => "GET_UPVALUE",
            OpCode::SetUpvalue => "SET_UPVALUE",
            OpCode::GetProperty => "GET_PROPERTY",
            OpCode::SetProperty => "SET_PROPERTY",
            OpCode::GetSuper => "GET_SUPER",
            OpCode::Equal => "EQUAL",
            OpCode::NotEqual => "NOT_EQUAL",
            OpCode::Greater => "GREATER",
            OpCode::GreaterEqual => "GREATER_EQUAL",
            OpCode::Less => "LESS",
            OpCode::LessEqual => "LESS_EQUAL",
            OpCode::Add => "ADD",
            OpCode::Subtract => "SUBTRACT",
            OpCode::Multiply => "MULTIPLY",
            OpCode::Divide => "DIVIDE",
            OpCode::Not => "NOT",
            OpCode::Negate => "NEGATE",
            OpCode::Print => "PRINT",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::Loop => "LOOP",
            OpCode::Call => "CALL",
            OpCode::Invoke => "INVOKE",
            OpCode::SuperInvoke => "SUPER_INVOKE",
            OpCode::Closure => "CLOSURE",
            OpCode::CloseUpvalue => "CLOSE_UPVALUE",
            OpCode::Return => "RETURN",
            OpCode::Class => "CLASS",
            OpCode::Inherit => "INHERIT",
            OpCode::Method => "METHOD",
        };
        write!(f, "{}", name)
    }
}

/// A flat bytecode buffer with its constant pool and a per-byte line table.
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
        }
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write(op as u8, line);
    }

    /// Appends to the constant pool; the compiler rejects indexes past 255.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn disassemble(&self, name: &str) -> String {
        let mut buffer = format!("== {} ==\n", name);
        let mut offset = 0;
        while offset < self.code.len() {
            let (text, size) = self.disassemble_instruction(offset);
            buffer += &text;
            offset += size;
        }
        buffer
    }

    pub fn disassemble_instruction(&self, offset: usize) -> (String, usize) {
        let mut buffer = format!("{:04} ", offset);
        if offset > 0 && self.lines[offset] == self.lines[offset - 1] {
            buffer += "   | ";
        } else {
            buffer += &format!("{:4} ", self.lines[offset]);
        }
        let op = OpCode::from(self.code[offset]);
        match op {
            OpCode::Constant
            | OpCode::GetGlobal
            | OpCode::DefineGlobal
            | OpCode::SetGlobal
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper
            | OpCode::Class
            | OpCode::Method => {
                let index = self.code[offset + 1] as usize;
                buffer += &format!("{:<16} {:4} '{}'\n", op.to_string(), index, self.constants[index]);
                (buffer, 2)
            }
            OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::Call => {
                let operand = self.code[offset + 1];
                buffer += &format!("{:<16} {:4}\n", op.to_string(), operand);
                (buffer, 2)
            }
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => {
                let jump =
                    ((self.code[offset + 1] as u16) << 8 | self.code[offset + 2] as u16) as isize;
                let sign: isize = if op == OpCode::Loop { -1 } else { 1 };
                let target = offset as isize + 3 + sign * jump;
                buffer += &format!("{:<16} {:4} -> {}\n", op.to_string(), offset, target);
                (buffer, 3)
            }
            OpCode::Invoke | OpCode::SuperInvoke => {
                let index = self.code[offset + 1] as usize;
                let arg_count = self.code[offset + 2];
                buffer += &format!(
                    "{:<16} ({} args) {:4} '{}'\n",
                    op.to_string(),
                    arg_count,
                    index,
                    self.constants[index]
                );
                (buffer, 3)
            }
            OpCode::Closure => {
                let index = self.code[offset + 1] as usize;
                buffer += &format!("{:<16} {:4} {}\n", op.to_string(), index, self.constants[index]);
                let function = self.constants[index].as_function();
                let upvalue_count = unsafe { (*function).data.upvalue_count };
                for i in 0..upvalue_count {
                    let is_local = self.code[offset + 2 + i * 2] != 0;
                    let slot = self.code[offset + 3 + i * 2];
                    buffer += &format!(
                        "{:04}      |                     {} {}\n",
                        offset + 2 + i * 2,
                        if is_local { "local" } else { "upvalue" },
                        slot
                    );
                }
                (buffer, 2 + upvalue_count * 2)
            }
            _ => {
                buffer += &format!("{}\n", op);
                (buffer, 1)
            }
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.disassemble("chunk"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_and_lines_stay_parallel() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 2);
        assert_eq!(chunk.code.len(), chunk.lines.len());
        assert_eq!(chunk.lines, vec![1, 2]);
    }

    #[test]
    fn constants_index_in_order() {
        let mut chunk = Chunk::new();
        assert_eq!(chunk.add_constant(Value::Number(1.0)), 0);
        assert_eq!(chunk.add_constant(Value::Number(2.0)), 1);
    }

    #[test]
    fn opcode_byte_round_trip() {
        for byte in 0..=39u8 {
            let op = OpCode::from(byte);
            assert_eq!(op as u8, byte);
        }
    }

    #[test]
    fn disassembles_simple_sequence() {
        let mut chunk = Chunk::new();
        let constant = chunk.add_constant(Value::Number(1.5));
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(constant as u8, 1);
        chunk.write_op(OpCode::Negate, 1);
        chunk.write_op(OpCode::Return, 1);
        let listing = chunk.disassemble("test");
        assert!(listing.contains("CONSTANT"));
        assert!(listing.contains("1.5"));
        assert!(listing.contains("NEGATE"));
        assert!(listing.contains("RETURN"));
    }
}
