//! The compilation driver: phase orchestration, error budget, output.
//!
//! Phases run strictly in order: preprocess, standard-library constants,
//! parse + fold, object-tree build, map conversion, bytecode emission,
//! JSON serialization. Every phase checks the abort flag; once the error
//! budget is exceeded the remaining phases are skipped.

use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use crate::{
    ast::{Expr, ExprKind, Stmt, StmtKind},
    bytecode::{EmitError, ProcCompiler},
    codetree::build_code_tree,
    diagnostics::{Diagnostics, ErrorLevel, WarningCode},
    dmm::{parse_map, DreamMap},
    fold::fold_file,
    indent::IndentLexer,
    location::Location,
    objtree::ObjectTree,
    output::build_output,
    parse::Parser,
    preprocess::Preprocessor,
    token::{Token, TokenKind},
};

/// Maximum number of preprocessed tokens before compilation aborts.
const MAX_TOKENS: usize = 10_000_000;
/// Default error budget.
pub const DEFAULT_MAX_ERRORS: u32 = 100;

/// Compiler settings, filled from the command line.
#[derive(Debug, Clone)]
pub struct Settings {
    pub files: Vec<PathBuf>,
    pub macro_defines: Vec<(String, String)>,
    pub lib_paths: Vec<PathBuf>,
    pub suppress_unimplemented: bool,
    pub suppress_unsupported: bool,
    pub skip_anything_typecheck: bool,
    pub dump_preprocessor: bool,
    pub no_standard: bool,
    pub verbose: bool,
    pub notices_enabled: bool,
    pub no_opts: bool,
    pub max_errors: u32,
    pub dm_version: i64,
    pub dm_build: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            macro_defines: Vec::new(),
            lib_paths: Vec::new(),
            suppress_unimplemented: false,
            suppress_unsupported: false,
            skip_anything_typecheck: false,
            dump_preprocessor: false,
            no_standard: false,
            verbose: false,
            notices_enabled: false,
            no_opts: false,
            max_errors: DEFAULT_MAX_ERRORS,
            dm_version: 515,
            dm_build: 1655,
        }
    }
}

/// Tracks elapsed time for the slow-compile heartbeat.
struct ProgressTimer {
    start: Instant,
    last_report: Instant,
}

impl ProgressTimer {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_report: now,
        }
    }

    fn check(&mut self, phase: &str) {
        let total = self.start.elapsed().as_secs();
        if total > 60 && self.last_report.elapsed().as_secs() >= 10 {
            println!("[{total}s] {phase} in progress...");
            self.last_report = Instant::now();
        }
    }
}

/// The compiler instance: owns all state for one compilation.
pub struct Compiler {
    settings: Settings,
    pub diag: Diagnostics,
    tree: ObjectTree,
    tokens: Vec<Token>,
    map_paths: Vec<PathBuf>,
    maps: Vec<DreamMap>,
    interface: Option<PathBuf>,
    timer: ProgressTimer,
}

impl Compiler {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        let mut diag = Diagnostics::new(settings.max_errors, settings.notices_enabled);
        if settings.suppress_unimplemented {
            diag.emit(
                WarningCode::UnimplementedAccess,
                Location::INTERNAL,
                "Unimplemented proc & var warnings are suppressed",
            );
            diag.set_pragma(WarningCode::UnimplementedAccess, ErrorLevel::Disabled);
        }
        if settings.suppress_unsupported {
            diag.set_pragma(WarningCode::UnsupportedAccess, ErrorLevel::Disabled);
        }
        let tree = ObjectTree::new(settings.no_standard);
        Self {
            settings,
            diag,
            tree,
            tokens: Vec::new(),
            map_paths: Vec::new(),
            maps: Vec::new(),
            interface: None,
            timer: ProgressTimer::new(),
        }
    }

    /// Runs the full pipeline. Returns `true` when compilation produced an
    /// artifact with zero errors.
    pub fn compile(&mut self) -> bool {
        println!("dreamc {}", env!("CARGO_PKG_VERSION"));
        if let Some(first) = self.settings.files.first() {
            println!("Compiling: {}", first.display());
        }
        if self.settings.no_opts {
            self.diag.warning("Compiler optimizations disabled via --no-opts");
        }

        let mut ok = self.run_phase("Preprocessing", Self::preprocess);
        if ok && !self.diag.should_abort() {
            ok = self.run_phase("DMStandard constants", Self::install_standard_constants);
        }
        let ast = if ok && !self.diag.should_abort() {
            self.run_phase_value("Parsing", Self::parse)
        } else {
            None
        };
        if let Some(ast) = ast {
            ok = self.run_phase_with("Object tree", ast, Self::build);
        } else {
            ok = false;
        }
        if ok && !self.diag.should_abort() && !self.map_paths.is_empty() {
            ok = self.run_phase("Map conversion", Self::convert_maps);
        }
        if ok && !self.diag.should_abort() {
            ok = self.run_phase("Bytecode emission", Self::emit_bytecode);
        }
        if ok && !self.diag.should_abort() {
            ok = self.run_phase("JSON output", Self::write_output);
        }

        let success = ok && self.diag.error_count() == 0;
        if success {
            println!("Compilation succeeded with {} warnings", self.diag.warning_count());
        } else {
            println!(
                "Compilation failed with {} errors and {} warnings",
                self.diag.error_count(),
                self.diag.warning_count()
            );
        }
        println!("Total time: {}s", self.timer.start.elapsed().as_secs());
        success
    }

    fn run_phase(&mut self, name: &str, phase: fn(&mut Self) -> bool) -> bool {
        let start = Instant::now();
        let ok = phase(self);
        if self.settings.verbose {
            println!("{name} took {}ms", start.elapsed().as_millis());
        }
        ok
    }

    fn run_phase_value(&mut self, name: &str, phase: fn(&mut Self) -> Option<Vec<Stmt>>) -> Option<Vec<Stmt>> {
        let start = Instant::now();
        let result = phase(self);
        if self.settings.verbose {
            println!("{name} took {}ms", start.elapsed().as_millis());
        }
        result
    }

    fn run_phase_with(&mut self, name: &str, ast: Vec<Stmt>, phase: fn(&mut Self, Vec<Stmt>) -> bool) -> bool {
        let start = Instant::now();
        let ok = phase(self, ast);
        if self.settings.verbose {
            println!("{name} took {}ms", start.elapsed().as_millis());
        }
        ok
    }

    // ------------------------------------------------------------------
    // Phases

    fn preprocess(&mut self) -> bool {
        let settings = self.settings.clone();

        // Decide on the standard library before the preprocessor borrows
        // the diagnostic sink.
        let standard_file = if settings.no_standard {
            if settings.verbose {
                println!("  Skipping DMStandard (--no-standard flag set)");
            }
            None
        } else if let Some(standard) = crate::stdlib::standard_dir() {
            let candidate = standard.join("_Standard.dm");
            if candidate.exists() {
                Some(candidate)
            } else {
                self.diag
                    .warning(format!("DMStandard/_Standard.dm not found at: {}", candidate.display()));
                self.diag
                    .warning("Compiling without standard library. Use --no-standard to suppress this warning.");
                None
            }
        } else {
            self.diag.warning("Failed to get executable path, using no standard library");
            None
        };

        let mut over_limit = false;
        {
            let mut preprocessor = Preprocessor::new(
                &mut self.diag,
                settings.lib_paths.clone(),
                settings.dm_version,
                settings.dm_build,
            );
            for (name, value) in &settings.macro_defines {
                preprocessor.define(name, value);
            }
            if let Some(standard_file) = &standard_file {
                preprocessor.preprocess_file(standard_file, true, &mut self.tokens);
            }
            for file in &settings.files {
                self.timer.check("Preprocessing");
                preprocessor.preprocess_file(file, false, &mut self.tokens);
                if self.tokens.len() > MAX_TOKENS {
                    over_limit = true;
                    break;
                }
            }
            self.map_paths = std::mem::take(&mut preprocessor.maps);
            self.interface = preprocessor.interface.take();
        }

        if over_limit {
            self.diag
                .error(Location::INTERNAL, format!("Token limit exceeded ({MAX_TOKENS} tokens)"));
            return false;
        }
        if self.settings.dump_preprocessor {
            self.dump_preprocessed_tokens();
        }
        !self.diag.should_abort()
    }

    fn dump_preprocessed_tokens(&mut self) {
        let Some(first) = self.settings.files.first() else { return };
        let path = first.with_extension("preprocessed.dm");
        let mut text = String::new();
        for token in &self.tokens {
            match token.kind {
                TokenKind::Newline => text.push('\n'),
                TokenKind::Whitespace => text.push_str(&token.text),
                TokenKind::String => {
                    text.push('"');
                    text.push_str(&token.text);
                    text.push_str("\" ");
                }
                TokenKind::Resource => {
                    text.push('\'');
                    text.push_str(&token.text);
                    text.push_str("' ");
                }
                _ => {
                    text.push_str(&token.text);
                    text.push(' ');
                }
            }
        }
        if let Err(err) = std::fs::write(&path, text) {
            self.diag
                .warning(format!("Failed to write {}: {err}", path.display()));
        } else if self.settings.verbose {
            println!("  Preprocessor output written to {}", path.display());
        }
    }

    fn install_standard_constants(&mut self) -> bool {
        if !self.settings.no_standard {
            crate::stdlib::install_constants(&mut self.diag, &mut self.tree);
        }
        true
    }

    fn parse(&mut self) -> Option<Vec<Stmt>> {
        if self.tokens.is_empty() {
            self.diag.error(Location::INTERNAL, "No tokens to parse");
            return None;
        }
        let tokens = std::mem::take(&mut self.tokens);
        let stream = IndentLexer::new(tokens);
        let mut statements = {
            let mut parser = Parser::new(&mut self.diag, stream);
            parser.parse_file()
        };
        fold_file(&mut self.diag, &mut statements);
        Some(statements)
    }

    fn build(&mut self, ast: Vec<Stmt>) -> bool {
        build_code_tree(&mut self.diag, &mut self.tree, ast);
        if self.settings.verbose {
            println!("  Types: {}", self.tree.objects.len());
            println!("  Procs: {}", self.tree.procs.len());
        }
        true
    }

    fn convert_maps(&mut self) -> bool {
        let mut z_offset = 1u32;
        for path in std::mem::take(&mut self.map_paths) {
            self.timer.check("Converting maps");
            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(err) => {
                    self.diag
                        .error(Location::INTERNAL, format!("Failed to open map file {}: {err}", path.display()));
                    continue;
                }
            };
            let file = self.diag.files.intern(&path.display().to_string());
            match parse_map(&mut self.diag, file, &source, z_offset) {
                Some((map, next_z)) => {
                    z_offset = next_z;
                    self.maps.push(map);
                }
                None => {
                    self.diag
                        .error(Location::INTERNAL, format!("Failed to parse map: {}", path.display()));
                }
            }
        }
        true
    }

    fn emit_bytecode(&mut self) -> bool {
        self.create_init_procs();

        let mut strings = std::mem::take(&mut self.tree.strings);
        let mut resources = std::mem::take(&mut self.tree.resources);

        for index in 0..self.tree.procs.len() {
            if self.diag.should_abort() {
                break;
            }
            self.timer.check("Emitting bytecode");
            let Some(body) = self.tree.procs[index].body.take() else {
                continue;
            };
            let (owner, name, location) = {
                let proc = &self.tree.procs[index];
                (proc.owner, proc.name.clone(), proc.location)
            };
            let parameters: Vec<(String, Option<Expr>)> = self.tree.procs[index]
                .parameters
                .iter()
                .map(|p| (p.name.clone(), p.default.clone()))
                .collect();

            let compiler = ProcCompiler::new(&mut self.diag, &self.tree, &mut strings, &mut resources, owner, &name);
            match compiler.compile(&parameters, &body, location) {
                Ok((bytecode, max_stack, source_info)) => {
                    let proc = &mut self.tree.procs[index];
                    proc.bytecode = bytecode;
                    proc.max_stack = max_stack;
                    proc.source_info = source_info;
                }
                Err(error) => {
                    self.report_emit_error(&name, &error);
                }
            }
        }

        self.tree.strings = strings;
        self.tree.resources = resources;
        true
    }

    fn report_emit_error(&mut self, proc_name: &str, error: &EmitError) {
        match error {
            EmitError::UnknownIdentifier(..) | EmitError::UnknownProc(..) | EmitError::UnknownType(..) => {
                self.diag.emit(
                    WarningCode::UnknownVariable,
                    error.location(),
                    format!("{error}; proc \"{proc_name}\" left uncompiled"),
                );
            }
            EmitError::UnknownLabel(..) | EmitError::StackImbalance(..) | EmitError::Unsupported(..) => {
                self.diag
                    .warning(format!("Failed to compile proc \"{proc_name}\": {error}"));
            }
        }
    }

    /// Synthesizes `<init>` procs for objects whose variable defaults are
    /// not compile-time constants; those assignments run when an instance
    /// is created.
    fn create_init_procs(&mut self) {
        for index in 0..self.tree.objects.len() {
            let object = &self.tree.objects[index];
            let object_id = object.id;
            let inits: Vec<(String, Expr)> = object
                .variables
                .values()
                .chain(object.variable_overrides.values())
                .filter_map(|variable| {
                    let value = variable.value.as_ref()?;
                    if value.try_const().is_some() {
                        return None;
                    }
                    Some((variable.name.clone(), value.clone()))
                })
                .collect();
            if inits.is_empty() {
                continue;
            }

            let loc = Location::INTERNAL;
            let body: Vec<Stmt> = inits
                .into_iter()
                .map(|(name, value)| Stmt {
                    loc,
                    kind: StmtKind::Expr(Expr::new(
                        loc,
                        ExprKind::Assign {
                            op: crate::ast::AssignOp::Assign,
                            target: Box::new(Expr::new(
                                loc,
                                ExprKind::Deref {
                                    object: Box::new(Expr::new(loc, ExprKind::Ident("src".to_owned()))),
                                    op: crate::ast::DerefOp::Dot,
                                    field: name,
                                },
                            )),
                            value: Box::new(value),
                        },
                    )),
                })
                .collect();

            let proc_id = self.tree.create_proc("<init>", object_id, false, loc);
            self.tree.proc_mut(proc_id).body = Some(body);
            self.tree.object_mut(object_id).init_proc = Some(proc_id);
        }
    }

    fn write_output(&mut self) -> bool {
        let interface = self.interface_str();
        let value = build_output(&mut self.tree, &self.diag, &self.maps, interface.as_deref());
        let Some(first) = self.settings.files.first() else {
            self.diag.error(Location::INTERNAL, "No input file to derive output path from");
            return false;
        };
        let path = first.with_extension("json");
        let text = serde_json::to_string_pretty(&value).expect("output JSON serializes");
        match std::fs::write(&path, text) {
            Ok(()) => {
                println!("Output written to: {}", path.display());
                true
            }
            Err(err) => {
                self.diag
                    .error(Location::INTERNAL, format!("Failed to open output file {}: {err}", path.display()));
                false
            }
        }
    }

    fn interface_str(&self) -> Option<String> {
        self.interface.as_ref().map(|p| p.display().to_string())
    }

    /// Access to the built object tree, for inspection and tests.
    #[must_use]
    pub fn tree(&self) -> &ObjectTree {
        &self.tree
    }
}

/// Compiles in-memory source through the full pipeline without touching
/// the filesystem or the bundled standard library. Used by tests and
/// embedding callers.
pub fn compile_source(name: &str, source: &str, settings: Settings) -> (serde_json::Value, Diagnostics) {
    let mut diag = Diagnostics::new(settings.max_errors, settings.notices_enabled);
    let mut tree = ObjectTree::new(true);

    let mut tokens = Vec::new();
    {
        let mut preprocessor = Preprocessor::new(&mut diag, settings.lib_paths.clone(), settings.dm_version, settings.dm_build);
        for (key, value) in &settings.macro_defines {
            preprocessor.define(key, value);
        }
        preprocessor.preprocess_source(name, source.to_owned(), false, &mut tokens);
    }

    if tokens.is_empty() {
        diag.error(Location::INTERNAL, "No tokens to parse");
        return (serde_json::Value::Null, diag);
    }

    let stream = IndentLexer::new(tokens);
    let mut statements = {
        let mut parser = Parser::new(&mut diag, stream);
        parser.parse_file()
    };
    fold_file(&mut diag, &mut statements);
    build_code_tree(&mut diag, &mut tree, statements);

    let mut driver = Compiler {
        settings,
        diag,
        tree,
        tokens: Vec::new(),
        map_paths: Vec::new(),
        maps: Vec::new(),
        interface: None,
        timer: ProgressTimer::new(),
    };
    driver.emit_bytecode();
    let value = build_output(&mut driver.tree, &driver.diag, &[], None);
    (value, driver.diag)
}

/// File-based convenience entry: builds a compiler, runs it, and reports
/// whether the artifact was produced without errors.
pub fn compile_files(settings: Settings) -> bool {
    Compiler::new(settings).compile()
}

impl Compiler {
    /// Derives the output artifact path for a given root file.
    #[must_use]
    pub fn output_path(input: &Path) -> PathBuf {
        input.with_extension("json")
    }
}
