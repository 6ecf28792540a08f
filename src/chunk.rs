//! Contains a [Chunk] of [OpCode].

use crate::value::{Value, ValueArray};
use crate::with_try_from_u8;

with_try_from_u8! {
    /// A one-byte operation code for Lox.
    #[repr(u8)]
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
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
        Equal,
        Greater,
        Less,
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
        Return,
    }
}

/// The largest value a forward/backward jump's 16-bit operand may encode.
pub const MAX_JUMP: usize = u16::MAX as usize;

/// The largest index a constant-pool entry may have, since `OP_CONSTANT` encodes it in one byte.
pub const MAX_CONSTANTS: usize = u8::MAX as usize + 1;

/// A chunk of code, with metadata.
///
/// (See Crafting Interpreters, p. 244)
#[derive(Default, Debug)]
pub struct Chunk {
    code: Vec<u8>,
    pub constants: ValueArray,
    lines: Vec<LineNumberRun>,
}

/// A valid byte from a chunk. This byte can then be interpreted as required.
#[derive(Clone, Copy)]
pub struct BytecodeEntry<'a> {
    byte: u8,
    provenance: &'a Chunk,
}

/// An [OpCode] that has already been written to the bytestream.
///
/// This opcode can be augmented with an additional operand.
pub struct WrittenOpcode<'a> {
    line: usize,
    provenance: &'a mut Chunk,
}

/// An entry of run-length encoded line numbers.
/// Every entry signifies that the next `length` bytes have the same line number. This is an
/// implementation of a "one line number per byte" parallel sequence: any offset's line number can
/// still be recovered, and in practice a chunk has far fewer distinct lines than bytes.
#[derive(Debug, Clone)]
struct LineNumberRun {
    /// The actual line number
    line_number: usize,
    /// How many consecutive bytes share this line number
    length: usize,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl Chunk {
    /// Return a new, empty [Chunk].
    pub fn new() -> Self {
        Chunk::default()
    }

    /// Get an entry from the bytecode stream.
    ///
    /// Returns `Some(entry)` when the offset is in `[0, self.len())`.
    pub fn get(&self, offset: usize) -> Option<BytecodeEntry> {
        self.code.get(offset).copied().map(|byte| BytecodeEntry {
            byte,
            provenance: self,
        })
    }

    /// Append a single [OpCode] to the chunk.
    pub fn write_opcode(&mut self, opcode: OpCode, line: usize) -> WrittenOpcode {
        self.write_byte(opcode as u8, line);

        WrittenOpcode {
            line,
            provenance: self,
        }
    }

    /// Append a raw byte to the chunk. Used for opcode operands: local slots, constant-pool
    /// indices, argument counts, and jump-offset placeholder/patched bytes.
    pub fn write_byte(&mut self, byte: u8, line: usize) {
        self.code.push(byte);

        if let Some(run) = self.previous_line_number_run() {
            if run.line_number == line {
                run.increment()
            } else {
                self.lines.push(LineNumberRun::new(line))
            }
        } else {
            assert!(self.lines.is_empty());
            self.lines.push(LineNumberRun::new(line))
        }
    }

    /// Adds a constant to the constant pool, and returns its index.
    ///
    /// Returns `None` once the pool already holds [MAX_CONSTANTS] entries, since `OP_CONSTANT`'s
    /// operand can only encode indices 0..=255. The caller (the compiler) turns this into a
    /// diagnostic rather than panicking.
    pub fn add_constant(&mut self, value: Value) -> Option<u8> {
        if self.constants.len() >= MAX_CONSTANTS {
            return None;
        }
        let index = self.constants.write(value);
        u8::try_from(index).ok()
    }

    /// Overwrites a single already-written byte. Used to patch forward-jump placeholders once
    /// their target offset is known. This is the only form of random-access mutation a chunk
    /// permits; everything else is append-only.
    pub fn patch_byte(&mut self, offset: usize, byte: u8) {
        self.code[offset] = byte;
    }

    /// Returns the line number for whatever is at the given offset.
    pub fn line_number_for(&self, offset: usize) -> Option<usize> {
        let mut base_offset = 0;
        for run in self.lines.iter() {
            if (base_offset..base_offset + run.length).contains(&offset) {
                return Some(run.line_number);
            }

            base_offset += run.length;
        }

        None
    }

    /// Returns the length of the byte stream.
    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Returns true if nothing has been appended to the byte stream.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Return the last line number run
    #[inline(always)]
    fn previous_line_number_run(&mut self) -> Option<&mut LineNumberRun> {
        self.lines.iter_mut().next_back()
    }
}

impl LineNumberRun {
    fn new(line_number: usize) -> Self {
        Self {
            line_number,
            length: 1,
        }
    }

    fn increment(&mut self) {
        self.length += 1;
    }
}

impl<'a> BytecodeEntry<'a> {
    /// Returns the byte as an index into the constant pool.
    #[inline(always)]
    pub fn as_constant_index(self) -> usize {
        self.byte as usize
    }

    /// Returns the byte decoded as an [OpCode].
    /// Returns `None` if the byte is not a valid opcode.
    #[inline]
    pub fn as_opcode(self) -> Option<OpCode> {
        self.byte.try_into().ok()
    }

    /// Returns the raw byte value, e.g. for local slots or argument counts.
    #[inline(always)]
    pub fn as_byte(self) -> u8 {
        self.byte
    }

    /// Yanks out a constant from the constant pool.
    #[inline]
    pub fn resolve_constant(self) -> Option<Value> {
        self.provenance.constants.get(self.as_constant_index())
    }

    /// Same as [BytecodeEntry::resolve_constant], but returns (index, value).
    #[inline]
    pub fn resolve_constant_with_index(self) -> Option<(usize, Value)> {
        self.resolve_constant()
            .map(|value| (self.as_constant_index(), value))
    }
}

impl<'a> WrittenOpcode<'a> {
    /// Consumes `self` and appends the operand to the byte stream for the last written
    /// instruction.
    #[inline]
    pub fn with_operand(self, operand: u8) {
        self.provenance.write_byte(operand, self.line);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn boring_test_of_chunk() {
        let c = Chunk::default();
        assert_eq!(0, c.len());
    }

    #[test]
    fn mess_around_with_bytecode() {
        let mut c = Chunk::new();
        let i = c.add_constant(1.0.into()).unwrap();
        c.write_opcode(OpCode::Constant, 123).with_operand(i);
        c.write_opcode(OpCode::Return, 123);

        assert!(c.len() >= 3);

        // Constant
        assert_eq!(Some(OpCode::Constant), c.get(0).unwrap().as_opcode());
        assert_eq!(Some(0), c.get(1).map(|b| b.as_constant_index()));

        // Return
        assert_eq!(Some(OpCode::Return), c.get(2).unwrap().as_opcode());
    }

    #[test]
    fn line_numbers() {
        let mut c = Chunk::new();

        let idx = c.add_constant(1.2.into()).unwrap();

        // Write a bunch of opcodes on the same line.
        c.write_opcode(OpCode::Constant, 1).with_operand(idx);
        c.write_opcode(OpCode::Constant, 1).with_operand(idx);
        c.write_opcode(OpCode::Constant, 1).with_operand(idx);
        assert_eq!(6, c.len());

        // Write a bunch of opcodes on a different line.
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        assert_eq!(14, c.len());

        // Write an opcode on yet a different line
        c.write_opcode(OpCode::Return, 4);
        assert_eq!(15, c.len());

        // Check line numbers.
        assert_eq!(Some(1), c.line_number_for(2));
        assert_eq!(Some(2), c.line_number_for(10));
        assert_eq!(Some(4), c.line_number_for(c.len() - 1));
    }

    #[test]
    fn constant_pool_refuses_a_257th_entry() {
        let mut c = Chunk::new();
        for _ in 0..MAX_CONSTANTS {
            assert!(c.add_constant(Value::Nil).is_some());
        }
        assert!(c.add_constant(Value::Nil).is_none());
    }

    #[test]
    fn patch_byte_overwrites_a_placeholder() {
        let mut c = Chunk::new();
        c.write_opcode(OpCode::Jump, 1).with_operand(0xff);
        c.write_byte(0xff, 1);
        c.patch_byte(1, 0x01);
        c.patch_byte(2, 0x02);
        assert_eq!(0x01, c.get(1).unwrap().as_byte());
        assert_eq!(0x02, c.get(2).unwrap().as_byte());
    }
}
