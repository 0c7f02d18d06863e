#![doc = include_str!("../../../README.md")]

mod ast;
mod bytecode;
mod codetree;
mod compiler;
mod diagnostics;
mod dmm;
mod fold;
mod indent;
mod intern;
mod lexer;
mod location;
mod objtree;
mod output;
mod parse;
mod path;
mod preprocess;
mod stdlib;
mod token;

pub use crate::{
    ast::{
        AssignOp, BinaryOp, CallArg, ConstValue, DerefOp, Expr, ExprKind, ForList, LocalVarDecl, ProcParam, Stmt,
        StmtKind, SwitchCase, SwitchValue, UnaryOp,
    },
    bytecode::{decode, simulate_max_stack, EmitError, Instruction, Opcode, ProcCompiler},
    codetree::build_code_tree,
    compiler::{compile_files, compile_source, Compiler, Settings, DEFAULT_MAX_ERRORS},
    diagnostics::{Diagnostic, Diagnostics, ErrorLevel, WarningCode},
    dmm::{parse_map, DreamMap, MapBlock, MapCell},
    fold::{fold_expr, fold_file},
    indent::IndentLexer,
    intern::{StringId, StringTable},
    lexer::Lexer,
    location::{FileId, FileTable, Location},
    objtree::{Object, ObjectTree, Proc, ProcId, ProcParameter, SourceInfo, TypeId, Variable},
    output::{build_output, const_json},
    parse::Parser,
    path::{DreamPath, PathKind},
    preprocess::{Macro, Preprocessor},
    stdlib::scan_defines,
    token::{Token, TokenKind, TokenValue},
};
