//! Builder for emitting bytecode during proc compilation.
//!
//! Handles encoding opcodes and operands into raw bytes, managing forward
//! jumps that need patching, and tracking the current and maximum stack
//! depth. Depth accounting is exact: the proc compiler asserts expected
//! depths at control-flow merge points and abandons the proc on mismatch.

use crate::objtree::SourceInfo;

use super::op::Opcode;

/// Label for a forward jump that needs patching: the offset of the jump
/// instruction's opcode byte.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

/// Accumulates bytecode, stack depth, and source-info entries for one proc.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    bytecode: Vec<u8>,
    current_depth: i32,
    max_depth: i32,
    underflowed: bool,
    current_line: u32,
    source_info: Vec<SourceInfo>,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source line recorded for subsequently emitted instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    fn start_instruction(&mut self) {
        let offset = u32::try_from(self.bytecode.len()).expect("bytecode length exceeds u32");
        match self.source_info.last() {
            Some(last) if last.line == self.current_line => {}
            _ => self.source_info.push(SourceInfo {
                offset,
                line: self.current_line,
            }),
        }
    }

    fn adjust(&mut self, delta: i16) {
        self.current_depth += i32::from(delta);
        if self.current_depth < 0 {
            self.underflowed = true;
        }
        self.max_depth = self.max_depth.max(self.current_depth);
    }

    /// Emits a no-operand instruction with a fixed stack effect.
    pub fn emit(&mut self, op: Opcode) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        let effect = op.stack_effect().expect("opcode requires operand-aware emission");
        self.adjust(effect);
    }

    /// Emits an instruction with a u8 operand (local slots).
    pub fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand);
        let effect = op.stack_effect().expect("opcode requires operand-aware emission");
        self.adjust(effect);
    }

    /// Emits an instruction with a u32 id operand.
    pub fn emit_u32(&mut self, op: Opcode, operand: u32) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
        let effect = op.stack_effect().expect("opcode requires operand-aware emission");
        self.adjust(effect);
    }

    /// Emits `PushInt` with its literal operand.
    pub fn emit_int(&mut self, value: i32) {
        self.start_instruction();
        self.bytecode.push(Opcode::PushInt as u8);
        self.bytecode.extend_from_slice(&value.to_le_bytes());
        self.adjust(1);
    }

    /// Emits `PushFloat` with its literal operand.
    pub fn emit_float(&mut self, value: f32) {
        self.start_instruction();
        self.bytecode.push(Opcode::PushFloat as u8);
        self.bytecode.extend_from_slice(&value.to_le_bytes());
        self.adjust(1);
    }

    /// Emits a call-family instruction with an id and argument count,
    /// applying the operand-dependent stack effect.
    pub fn emit_call(&mut self, op: Opcode, id: u32, arg_count: u8) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&id.to_le_bytes());
        self.bytecode.push(arg_count);
        let effect = match op {
            // Pops the receiver and the arguments, pushes the result.
            Opcode::CallMethod => -i16::from(arg_count),
            Opcode::CallOwn | Opcode::CallGlobal | Opcode::CreateObject | Opcode::FormatString => {
                1 - i16::from(arg_count)
            }
            _ => unreachable!("not a call-family opcode"),
        };
        self.adjust(effect);
    }

    /// Emits `CallParent` or `CreateObjectDynamic` (u8 argument count only).
    pub fn emit_call_u8(&mut self, op: Opcode, arg_count: u8) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.push(arg_count);
        let effect = match op {
            Opcode::CallParent => 1 - i16::from(arg_count),
            // Pops the type value and the arguments, pushes the result.
            Opcode::CreateObjectDynamic => -i16::from(arg_count),
            _ => unreachable!("not a u8 call opcode"),
        };
        self.adjust(effect);
    }

    /// Emits a forward jump, returning a label to patch later.
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        self.start_instruction();
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&0i16.to_le_bytes());
        match op {
            // Iterate pushes the next element on the fallthrough path.
            Opcode::Iterate => self.adjust(1),
            other => {
                let effect = other.stack_effect().expect("jump opcode has fixed effect");
                self.adjust(effect);
            }
        }
        label
    }

    /// Emits `SetupTryCatch` with the catch-variable slot (0xFF for none),
    /// returning the label for the handler address.
    #[must_use]
    pub fn emit_setup_try(&mut self, catch_slot: u8) -> JumpLabel {
        self.start_instruction();
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.push(Opcode::SetupTryCatch as u8);
        self.bytecode.extend_from_slice(&0i16.to_le_bytes());
        self.bytecode.push(catch_slot);
        label
    }

    /// Patches a forward jump to land at the current offset.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        self.patch_jump_to(label, self.bytecode.len());
    }

    /// Patches a forward jump to land at an explicit offset.
    pub fn patch_jump_to(&mut self, label: JumpLabel, target: usize) {
        let op = Opcode::from_repr(self.bytecode[label.0]).expect("label points at an opcode");
        let size = op.instruction_size();
        let base = i64::try_from(label.0 + size).expect("offset exceeds i64");
        let target = i64::try_from(target).expect("target exceeds i64");
        let offset = i16::try_from(target - base).expect("jump offset exceeds i16 range; proc too large");
        let bytes = offset.to_le_bytes();
        self.bytecode[label.0 + 1] = bytes[0];
        self.bytecode[label.0 + 2] = bytes[1];
    }

    /// Emits a backward jump to a known target offset.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        self.start_instruction();
        let base = i64::try_from(self.bytecode.len() + op.instruction_size()).expect("offset exceeds i64");
        let target_i64 = i64::try_from(target).expect("target exceeds i64");
        let offset = i16::try_from(target_i64 - base).expect("jump offset exceeds i16 range; proc too large");
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&offset.to_le_bytes());
        let effect = op.stack_effect().expect("jump opcode has fixed effect");
        self.adjust(effect);
    }

    /// The current bytecode offset; used for loop headers.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    #[must_use]
    pub fn stack_depth(&self) -> i32 {
        self.current_depth
    }

    /// Resets the tracked depth at a merge point where the incoming edge
    /// carries a known depth (e.g. the else arm after a taken branch).
    pub fn set_stack_depth(&mut self, depth: i32) {
        self.current_depth = depth;
        self.max_depth = self.max_depth.max(depth);
    }

    #[must_use]
    pub fn underflowed(&self) -> bool {
        self.underflowed
    }

    /// Finishes the proc, returning bytecode, max stack, and source info.
    #[must_use]
    pub fn build(self) -> (Vec<u8>, u16, Vec<SourceInfo>) {
        let max = u16::try_from(self.max_depth.max(0)).unwrap_or(u16::MAX);
        (self.bytecode, max, self.source_info)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bytecode::op::simulate_max_stack;

    #[test]
    fn emit_basic() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::PushNull);
        builder.emit(Opcode::Pop);
        let (bytecode, max, _) = builder.build();
        assert_eq!(bytecode, vec![Opcode::PushNull as u8, Opcode::Pop as u8]);
        assert_eq!(max, 1);
    }

    #[test]
    fn forward_jump_patches() {
        let mut builder = CodeBuilder::new();
        let jump = builder.emit_jump(Opcode::Jump);
        builder.emit(Opcode::PushNull);
        builder.emit(Opcode::Pop);
        builder.patch_jump(jump);
        builder.emit(Opcode::PushNull);
        builder.emit(Opcode::Return);
        let (bytecode, _, _) = builder.build();
        // Offset = 5 - 0 - 3 = 2.
        assert_eq!(bytecode[1..3], [2, 0]);
        assert_eq!(simulate_max_stack(&bytecode), Some(1));
    }

    #[test]
    fn backward_jump_encodes_negative_offset() {
        let mut builder = CodeBuilder::new();
        let start = builder.current_offset();
        builder.emit(Opcode::PushNull);
        builder.emit(Opcode::Pop);
        builder.emit_jump_to(Opcode::Jump, start);
        let (bytecode, _, _) = builder.build();
        let offset = i16::from_le_bytes([bytecode[3], bytecode[4]]);
        assert_eq!(offset, -5);
    }

    #[test]
    fn call_effects_account_for_arguments() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::PushNull);
        builder.emit(Opcode::PushNull);
        builder.emit(Opcode::PushNull);
        assert_eq!(builder.stack_depth(), 3);
        // Receiver + 2 args collapse into one result.
        builder.emit_call(Opcode::CallMethod, 7, 2);
        assert_eq!(builder.stack_depth(), 1);
    }

    #[test]
    fn underflow_is_detected() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::Pop);
        assert!(builder.underflowed());
    }

    #[test]
    fn source_info_records_line_changes() {
        let mut builder = CodeBuilder::new();
        builder.set_line(1);
        builder.emit(Opcode::PushNull);
        builder.emit(Opcode::Pop);
        builder.set_line(2);
        builder.emit(Opcode::PushNull);
        let (_, _, info) = builder.build();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].line, 1);
        assert_eq!(info[1].offset, 2);
        assert_eq!(info[1].line, 2);
    }

    #[test]
    fn setup_try_patches_handler() {
        let mut builder = CodeBuilder::new();
        let handler = builder.emit_setup_try(0xFF);
        builder.emit(Opcode::EndTryCatch);
        builder.patch_jump(handler);
        let (bytecode, _, _) = builder.build();
        // Instruction is 4 bytes; handler lands right after EndTryCatch.
        let offset = i16::from_le_bytes([bytecode[1], bytecode[2]]);
        assert_eq!(offset, 1);
    }
}
