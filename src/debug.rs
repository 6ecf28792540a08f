//! Helpers to print a debug representations.

use crate::chunk::{Chunk, OpCode};

/// Given a chunk, prints its disassembly to `stdout`
pub fn disassemble_chunk(c: &Chunk, name: &str) {
    println!("== {name} ==");

    let mut offset = 0;
    while offset < c.len() {
        offset = disassemble_instruction(c, offset);
    }
}

/// Print one instruction from the [Chunk] to `stdout`, taking into account its operands.
pub fn disassemble_instruction(c: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);

    if offset > 0 && at_same_line_as_previous_offset(c, offset) {
        print!("   | ");
    } else {
        let line_no = c.line_number_for(offset).unwrap();
        print!("{line_no:4} ")
    }

    let instruction = c
        .get(offset)
        .expect("offset too large")
        .as_opcode()
        .expect("Invalid byte for opcode");

    use OpCode::*;
    match instruction {
        Constant => constant_instruction("OP_CONSTANT", c, offset),
        Nil => simple_instruction("OP_NIL", offset),
        True => simple_instruction("OP_TRUE", offset),
        False => simple_instruction("OP_FALSE", offset),
        Pop => simple_instruction("OP_POP", offset),
        GetLocal => byte_instruction("OP_GET_LOCAL", c, offset),
        SetLocal => byte_instruction("OP_SET_LOCAL", c, offset),
        GetGlobal => constant_instruction("OP_GET_GLOBAL", c, offset),
        DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", c, offset),
        SetGlobal => constant_instruction("OP_SET_GLOBAL", c, offset),
        Equal => simple_instruction("OP_EQUAL", offset),
        Greater => simple_instruction("OP_GREATER", offset),
        Less => simple_instruction("OP_LESS", offset),
        Add => simple_instruction("OP_ADD", offset),
        Subtract => simple_instruction("OP_SUBTRACT", offset),
        Multiply => simple_instruction("OP_MULTIPLY", offset),
        Divide => simple_instruction("OP_DIVIDE", offset),
        Not => simple_instruction("OP_NOT", offset),
        Negate => simple_instruction("OP_NEGATE", offset),
        Print => simple_instruction("OP_PRINT", offset),
        Jump => jump_instruction("OP_JUMP", 1, c, offset),
        JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, c, offset),
        Loop => jump_instruction("OP_LOOP", -1, c, offset),
        Call => byte_instruction("OP_CALL", c, offset),
        Return => simple_instruction("OP_RETURN", offset),
    }
}

/////////////////////////////////////// Instruction printers ///////////////////////////////////////

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{name:>18}");
    offset + 1
}

/// Prints an instruction with a single raw-byte operand: a local slot or an argument count.
fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.get(offset + 1).expect("ran out of bytes").as_byte();
    println!("{name:>18} {slot:4}");
    offset + 2
}

/// Prints a jump/loop instruction with a 2-byte big-endian operand, resolving it to the absolute
/// offset it targets. `sign` is `1` for forward jumps, `-1` for `OP_LOOP`'s backward jump.
fn jump_instruction(name: &str, sign: isize, chunk: &Chunk, offset: usize) -> usize {
    let high = chunk.get(offset + 1).expect("ran out of bytes").as_byte() as u16;
    let low = chunk.get(offset + 2).expect("ran out of bytes").as_byte() as u16;
    let jump = (high << 8) | low;

    let target = offset as isize + 3 + sign * jump as isize;
    println!("{name:>18} {offset:4} -> {target}");
    offset + 3
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let (index, value) = chunk
        .get(offset + 1)
        .expect("ran out of bytes")
        .resolve_constant_with_index()
        .expect("Invalid constant index");

    println!("{name:>18} {index:4} '{value}'");

    offset + 2
}

//////////////////////////////////////////// Utilities ////////////////////////////////////////////

/// Returns true if the given offset is at the same line number as the previous line number.
fn at_same_line_as_previous_offset(chunk: &Chunk, offset: usize) -> bool {
    assert!(offset > 0);

    chunk
        .line_number_for(offset)
        .zip(chunk.line_number_for(offset - 1))
        .map(|(current_line, previous_line)| current_line == previous_line)
        .unwrap()
}
