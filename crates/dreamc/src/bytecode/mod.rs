//! Bytecode emission for compiled procs.
//!
//! - `op` - opcode definitions, decoding, and the stack simulator
//! - `builder` - byte emission, jump patching, stack-depth accounting
//! - `compiler` - AST statement/expression lowering

pub use builder::{CodeBuilder, JumpLabel};
pub use compiler::{EmitError, ProcCompiler};
pub use op::{decode, simulate_max_stack, Instruction, Opcode, Operand};

mod builder;
mod compiler;
mod op;
