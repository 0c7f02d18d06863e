//! The code-tree builder: walks the AST once and populates the object tree.
//!
//! The current path threads through recursive processing of object
//! statements; entering `/mob/player` pushes that scope for its inner
//! statements. Variable modifiers are extracted from declared type paths,
//! `/global` owners route to the global list, and the first statement from
//! outside the standard library finalizes standard-library marking.

use crate::{
    ast::{ConstValue, Expr, ProcParam, Stmt, StmtKind},
    diagnostics::{Diagnostics, WarningCode},
    location::Location,
    objtree::{proc_attributes, value_type, ObjectTree, ProcParameter, Variable},
    path::DreamPath,
};

/// Builds the object tree from parsed top-level statements, consuming them.
pub fn build_code_tree(diag: &mut Diagnostics, tree: &mut ObjectTree, statements: Vec<Stmt>) {
    let mut builder = Builder {
        diag,
        tree,
        standard_finalized: false,
    };
    let root = DreamPath::root();
    builder.process_statements(statements, &root);
}

struct Builder<'a> {
    diag: &'a mut Diagnostics,
    tree: &'a mut ObjectTree,
    standard_finalized: bool,
}

impl Builder<'_> {
    fn process_statements(&mut self, statements: Vec<Stmt>, current: &DreamPath) {
        for statement in statements {
            if self.diag.should_abort() {
                return;
            }
            self.process(statement, current);
        }
    }

    fn process(&mut self, statement: Stmt, current: &DreamPath) {
        if !self.standard_finalized && !statement.loc.in_standard && !statement.loc.is_internal() {
            self.tree.mark_standard();
            self.standard_finalized = true;
        }

        match statement.kind {
            StmtKind::ObjectDef { path, body } => self.process_object_def(path, body, current, statement.loc),
            StmtKind::VarDef { path, name, value } => {
                let scope = current.combine(&path);
                self.define_var(&scope, name, value, statement.loc);
            }
            StmtKind::VarOverride { path, name, value } => {
                let scope = current.combine(&path);
                if scope.contains("var") {
                    // Inside a var block a bare assignment is a definition.
                    self.define_var(&scope, name, Some(value), statement.loc);
                } else {
                    self.override_var(&scope, &name, value, statement.loc);
                }
            }
            StmtKind::ProcDef {
                object_path,
                name,
                is_verb,
                params,
                body,
            } => self.define_proc(current, &object_path, name, is_verb, params, body, statement.loc),
            // Proc-level statements are meaningless at object scope.
            _ => {}
        }
    }

    fn process_object_def(&mut self, path: DreamPath, body: Vec<Stmt>, current: &DreamPath, loc: Location) {
        let combined = current.combine(&path);

        if combined.contains("var") {
            if body.is_empty() && combined.last() != Some("var") {
                // A bare name under a var block declares a valueless var.
                let mut scope = combined.clone();
                let Some(name) = scope.elements.pop() else { return };
                self.define_var(&scope, name, None, loc);
                return;
            }
            // A var block itself creates no object.
            self.process_statements(body, &combined);
            return;
        }

        if combined.contains("proc") || combined.contains("verb") {
            // A proc/verb block; definitions inside pick up the marker from
            // the combined path.
            self.process_statements(body, &combined);
            return;
        }

        self.tree.get_or_create(&combined);
        self.process_statements(body, &combined);
    }

    /// Registers a variable definition. `scope` is the full declared path
    /// including the `var` segment, modifiers, and declared type.
    fn define_var(&mut self, scope: &DreamPath, name: String, value: Option<Expr>, loc: Location) {
        let elements = &scope.elements;
        let var_pos = elements.iter().position(|e| e == "var");
        let (owner_elements, rest) = match var_pos {
            Some(pos) => (&elements[..pos], &elements[pos + 1..]),
            None => (&elements[..], &[] as &[String]),
        };

        let mut variable = Variable::named(name);
        let mut type_start = 0;
        for element in rest {
            match element.as_str() {
                "const" => variable.is_const = true,
                "static" | "global" => variable.is_global = true,
                "tmp" => variable.is_tmp = true,
                "final" => variable.is_final = true,
                _ => break,
            }
            type_start += 1;
        }
        if type_start < rest.len() {
            variable.decl_type = Some(DreamPath::absolute(rest[type_start..].iter().cloned()));
        }
        variable.value = value;

        if owner_elements.len() == 1 && owner_elements[0] == "global" {
            variable.is_global = true;
            self.tree.add_global(variable);
            return;
        }

        let owner = DreamPath::absolute(owner_elements.iter().cloned());
        let owner_id = self.tree.get_or_create(&owner);
        let object = self.tree.object_mut(owner_id);
        if object.variables.contains_key(&variable.name) {
            self.diag.emit(
                WarningCode::DuplicateVariable,
                loc,
                format!("Duplicate definition of variable \"{}\" on {}", variable.name, owner),
            );
        }
        object.variables.insert(variable.name.clone(), variable);
    }

    /// Records a variable override, inheriting the declared type from the
    /// nearest ancestor that defines the variable.
    fn override_var(&mut self, scope: &DreamPath, name: &str, value: Expr, loc: Location) {
        let owner_id = self.tree.get_or_create(scope);

        // A redefinition on the defining object just replaces the default.
        if let Some(existing) = self.tree.object(owner_id).variables.get(name) {
            if existing.is_const {
                self.diag.emit(
                    WarningCode::WriteToConstant,
                    loc,
                    format!("Cannot change constant variable \"{name}\""),
                );
                return;
            }
            self.tree.object_mut(owner_id).variables[name].value = Some(value);
            return;
        }

        let ancestor = self
            .tree
            .object(owner_id)
            .parent
            .and_then(|parent| self.tree.var_in_chain(parent, name));
        let Some((_, ancestor_var)) = ancestor else {
            self.diag.emit(
                WarningCode::ItemDoesntExist,
                loc,
                format!("Variable \"{name}\" is not defined on {} or its ancestors", scope),
            );
            return;
        };
        if ancestor_var.is_const {
            self.diag.emit(
                WarningCode::WriteToConstant,
                loc,
                format!("Cannot change constant variable \"{name}\""),
            );
            return;
        }

        let mut variable = Variable::named(name);
        variable.decl_type = ancestor_var.decl_type.clone();
        variable.is_tmp = ancestor_var.is_tmp;
        variable.value = Some(value);
        self.tree
            .object_mut(owner_id)
            .variable_overrides
            .insert(name.to_owned(), variable);
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the proc definition fields")]
    fn define_proc(
        &mut self,
        current: &DreamPath,
        object_path: &DreamPath,
        name: String,
        is_verb: bool,
        params: Vec<ProcParam>,
        body: Vec<Stmt>,
        loc: Location,
    ) {
        let combined = current.combine(object_path);
        let is_verb = is_verb || combined.contains("verb");
        let has_marker = combined.contains("proc") || combined.contains("verb");

        let owner_elements: Vec<String> = combined
            .elements
            .iter()
            .filter(|e| *e != "proc" && *e != "verb")
            .cloned()
            .collect();
        let owner = DreamPath::absolute(owner_elements);
        let owner_id = self.tree.get_or_create(&owner);

        if has_marker && self.tree.object(owner_id).has_proc(&name) {
            self.diag.emit(
                WarningCode::DuplicateProcDefinition,
                loc,
                format!("Proc \"{name}\" is defined twice on {owner}"),
            );
        }

        let proc_id = self.tree.create_proc(&name, owner_id, is_verb, loc);

        let parameters: Vec<ProcParameter> = params
            .into_iter()
            .map(|param| {
                let mut flags = 0u32;
                for as_type in &param.as_types {
                    match value_type::from_name(as_type) {
                        Some(flag) => flags |= flag,
                        None => self.diag.emit(
                            WarningCode::UnsupportedTypeCheck,
                            loc,
                            format!("Unknown input type \"{as_type}\""),
                        ),
                    }
                }
                if param.as_types.is_empty() {
                    if let Some(type_path) = &param.type_path {
                        flags = value_type::from_type_path(type_path);
                    }
                }
                ProcParameter {
                    name: param.name,
                    type_path: param.type_path,
                    default: param.default,
                    value_type: flags,
                }
            })
            .collect();

        self.apply_set_statements(proc_id, &body);

        let proc = self.tree.proc_mut(proc_id);
        proc.parameters = parameters;
        proc.body = Some(body);
    }

    /// Extracts verb metadata and proc attributes from top-level `set`
    /// statements in the body.
    fn apply_set_statements(&mut self, proc_id: crate::objtree::ProcId, body: &[Stmt]) {
        for statement in body {
            let StmtKind::Set { attr, value, in_list } = &statement.kind else {
                continue;
            };
            let constant = value.try_const();
            let proc = self.tree.proc_mut(proc_id);
            match attr.as_str() {
                "name" => {
                    if let Some(ConstValue::Str(s)) = constant {
                        proc.verb_name = Some(s);
                    }
                }
                "category" => {
                    if let Some(ConstValue::Str(s)) = constant {
                        proc.verb_category = Some(s);
                    }
                }
                "desc" => {
                    if let Some(ConstValue::Str(s)) = constant {
                        proc.verb_desc = Some(s);
                    }
                }
                "invisibility" => {
                    if let Some(ConstValue::Int(i)) = constant {
                        proc.invisibility = u8::try_from(i.clamp(0, 101)).unwrap_or(0);
                    }
                }
                "hidden" => {
                    if constant.is_none_or(|c| c.is_truthy()) {
                        proc.attributes |= proc_attributes::HIDDEN;
                    }
                }
                "background" => {
                    if constant.is_none_or(|c| c.is_truthy()) {
                        proc.attributes |= proc_attributes::BACKGROUND;
                    }
                }
                "waitfor" | "instant" => {
                    if constant.is_some_and(|c| !c.is_truthy()) {
                        proc.attributes |= proc_attributes::INSTANT;
                    }
                }
                "src" => {
                    proc.verb_src = Some(verb_src_code(value, *in_list));
                }
                other => {
                    self.diag.emit(
                        WarningCode::SoftReservedKeyword,
                        statement.loc,
                        format!("Unknown setting \"{other}\""),
                    );
                }
            }
        }
    }
}

/// Encodes a `set src` clause as a small integer understood by the VM.
fn verb_src_code(value: &Expr, in_list: bool) -> i32 {
    use crate::ast::ExprKind;
    if in_list {
        if let ExprKind::Call { callee, .. } = &value.kind {
            if let ExprKind::Ident(name) = &callee.kind {
                if name == "oview" {
                    return 3;
                }
            }
        }
        return 2;
    }
    match &value.kind {
        ExprKind::Deref { object, field, .. } => {
            if matches!(&object.kind, ExprKind::Ident(name) if name == "usr") && field == "loc" {
                1
            } else {
                0
            }
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{indent::IndentLexer, lexer::Lexer, parse::Parser};

    fn build(source: &str) -> (ObjectTree, Diagnostics) {
        let mut diag = Diagnostics::new(100, false);
        let file = diag.files.intern("test.dm");
        let tokens = Lexer::new(file, source.to_owned(), false, true).lex_all(&mut diag);
        let stream = IndentLexer::new(tokens);
        let statements = {
            let mut parser = Parser::new(&mut diag, stream);
            parser.parse_file()
        };
        let mut tree = ObjectTree::new(false);
        build_code_tree(&mut diag, &mut tree, statements);
        (tree, diag)
    }

    #[test]
    fn root_var_definition() {
        let (tree, diag) = build("var/x = 3\n");
        assert_eq!(diag.error_count(), 0);
        let root = tree.object(tree.root());
        assert!(root.variables.contains_key("x"));
    }

    #[test]
    fn object_with_parent_chain() {
        let (tree, _) = build("/mob/player/proc/hi()\n\treturn 42\n");
        let player = tree.lookup(&DreamPath::absolute(["mob", "player"])).unwrap();
        let mob = tree.lookup(&DreamPath::absolute(["mob"])).unwrap();
        assert_eq!(tree.object(player).parent, Some(mob));
        assert!(tree.object(player).has_proc("hi"));
    }

    #[test]
    fn var_block_defines_variables() {
        let (tree, diag) = build("mob\n\tvar\n\t\thealth = 100\n\t\tarmor\n");
        assert_eq!(diag.error_count(), 0);
        let mob = tree.lookup(&DreamPath::absolute(["mob"])).unwrap();
        let object = tree.object(mob);
        assert!(object.variables.contains_key("health"));
        assert!(object.variables.contains_key("armor"));
    }

    #[test]
    fn modifiers_extracted_from_path() {
        let (tree, _) = build("mob/var/const/MAX_HEALTH = 200\nmob/var/tmp/scratch\n");
        let mob = tree.lookup(&DreamPath::absolute(["mob"])).unwrap();
        let object = tree.object(mob);
        assert!(object.variables["MAX_HEALTH"].is_const);
        assert!(object.variables["scratch"].is_tmp);
    }

    #[test]
    fn declared_type_extracted_from_path() {
        let (tree, _) = build("mob/var/obj/item/weapon\n");
        let mob = tree.lookup(&DreamPath::absolute(["mob"])).unwrap();
        let decl_type = tree.object(mob).variables["weapon"].decl_type.as_ref().unwrap();
        assert_eq!(decl_type.to_string(), "/obj/item");
    }

    #[test]
    fn global_path_routes_to_globals() {
        let (tree, _) = build("/global/var/score = 0\n");
        assert!(tree.global_index("score").is_some());
        assert!(!tree.object(tree.root()).variables.contains_key("score"));
    }

    #[test]
    fn override_inherits_ancestor_type() {
        let (tree, diag) = build("mob/var/obj/item/weapon\nmob/player\n\tweapon = null\n");
        assert_eq!(diag.error_count(), 0);
        let player = tree.lookup(&DreamPath::absolute(["mob", "player"])).unwrap();
        let object = tree.object(player);
        let override_var = &object.variable_overrides["weapon"];
        assert_eq!(override_var.decl_type.as_ref().unwrap().to_string(), "/obj/item");
    }

    #[test]
    fn override_without_ancestor_errors() {
        let (_, diag) = build("mob/player\n\tnonexistent = 1\n");
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn override_of_const_errors() {
        let (_, diag) = build("mob/var/const/LIMIT = 5\nmob/player\n\tLIMIT = 6\n");
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn duplicate_variable_warns() {
        let (_, diag) = build("mob/var/x = 1\nmob/var/x = 2\n");
        assert!(diag.warning_count() >= 1);
    }

    #[test]
    fn root_proc_registers_globally() {
        let (tree, _) = build("proc/main()\n\treturn\n");
        assert!(tree.global_proc("main").is_some());
    }

    #[test]
    fn proc_parameters_become_typed() {
        let (tree, _) = build("proc/f(mob/target, count as num)\n\treturn\n");
        let id = tree.global_proc("f").unwrap();
        let proc = tree.proc(id);
        assert_eq!(proc.parameters.len(), 2);
        assert_eq!(proc.parameters[0].value_type, value_type::MOB);
        assert_eq!(proc.parameters[1].value_type, value_type::NUM);
    }

    #[test]
    fn verb_metadata_from_set_statements() {
        let source = "mob/verb/greet()\n\tset name = \"Say Hi\"\n\tset category = \"Social\"\n\tset invisibility = 3\n\treturn\n";
        let (tree, _) = build(source);
        let mob = tree.lookup(&DreamPath::absolute(["mob"])).unwrap();
        let proc_id = tree.object(mob).procs["greet"][0];
        let proc = tree.proc(proc_id);
        assert!(proc.is_verb);
        assert_eq!(proc.verb_name.as_deref(), Some("Say Hi"));
        assert_eq!(proc.verb_category.as_deref(), Some("Social"));
        assert_eq!(proc.invisibility, 3);
    }

    #[test]
    fn proc_definition_order_is_preserved() {
        let (tree, _) = build("mob/proc/act()\n\treturn 1\nmob/player/act()\n\treturn 2\n");
        let mob = tree.lookup(&DreamPath::absolute(["mob"])).unwrap();
        let player = tree.lookup(&DreamPath::absolute(["mob", "player"])).unwrap();
        assert!(tree.object(mob).has_proc("act"));
        assert!(tree.object(player).has_proc("act"));
        let mob_proc = tree.object(mob).procs["act"][0];
        let player_proc = tree.object(player).procs["act"][0];
        assert!(mob_proc.index() < player_proc.index());
    }

    #[test]
    fn standard_library_marking() {
        let mut diag = Diagnostics::new(100, false);
        let file = diag.files.intern("standard.dm");
        let tokens = Lexer::new(file, "datum/var/tag\n".to_owned(), true, true).lex_all(&mut diag);
        let user_file = diag.files.intern("user.dm");
        let user_tokens = Lexer::new(user_file, "mob/player\n\ttag = \"p\"\n".to_owned(), false, true).lex_all(&mut diag);
        let mut all = tokens;
        all.extend(user_tokens);
        let stream = IndentLexer::new(all);
        let statements = {
            let mut parser = Parser::new(&mut diag, stream);
            parser.parse_file()
        };
        let mut tree = ObjectTree::new(false);
        build_code_tree(&mut diag, &mut tree, statements);
        let datum = tree.lookup(&DreamPath::absolute(["datum"])).unwrap();
        let player = tree.lookup(&DreamPath::absolute(["mob", "player"])).unwrap();
        assert!(tree.object(datum).from_standard);
        assert!(!tree.object(player).from_standard);
    }
}
