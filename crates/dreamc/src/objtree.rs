//! The object tree: the type/proc/variable registry built from the AST.
//!
//! Objects and procs live in flat arenas indexed by monotonically assigned
//! ids; parents and owners are id references, never back-pointers. The tree
//! also owns the string/resource interning tables and the global registries
//! that end up in the serialized output.

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    ast::{Expr, Stmt},
    intern::StringTable,
    location::Location,
    path::{DreamPath, PathKind},
};

/// Index of an object (type) in the tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TypeId(u32);

impl TypeId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Index of a proc in the tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProcId(u32);

impl ProcId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Parameter/variable value-type flags from `as` clauses.
pub mod value_type {
    pub const ANYTHING: u32 = 0;
    pub const NULL: u32 = 1;
    pub const TEXT: u32 = 2;
    pub const OBJ: u32 = 4;
    pub const MOB: u32 = 8;
    pub const TURF: u32 = 16;
    pub const NUM: u32 = 32;
    pub const MESSAGE: u32 = 64;
    pub const AREA: u32 = 128;
    pub const COLOR: u32 = 256;
    pub const FILE: u32 = 512;
    pub const COMMAND_TEXT: u32 = 1024;
    pub const SOUND: u32 = 2048;
    pub const ICON: u32 = 4096;

    /// Maps an `as` clause name to its flag.
    #[must_use]
    pub fn from_name(name: &str) -> Option<u32> {
        Some(match name {
            "anything" => ANYTHING,
            "null" => NULL,
            "text" => TEXT,
            "obj" => OBJ,
            "mob" => MOB,
            "turf" => TURF,
            "num" => NUM,
            "message" => MESSAGE,
            "area" => AREA,
            "color" => COLOR,
            "file" => FILE,
            "command_text" => COMMAND_TEXT,
            "sound" => SOUND,
            "icon" => ICON,
            _ => return None,
        })
    }

    /// Infers a flag from a declared type path, the way verb argument
    /// types default when no `as` clause is given.
    #[must_use]
    pub fn from_type_path(path: &crate::path::DreamPath) -> u32 {
        match path.elements.first().map(String::as_str) {
            Some("obj") => OBJ,
            Some("mob") => MOB,
            Some("turf") => TURF,
            Some("area") => AREA,
            _ => ANYTHING,
        }
    }
}

/// Proc attribute flags derived from `set` statements.
pub mod proc_attributes {
    pub const NONE: u32 = 0;
    pub const HIDDEN: u32 = 1;
    pub const BACKGROUND: u32 = 2;
    pub const INSTANT: u32 = 4;
}

/// A variable definition or override on a type, or a global.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub decl_type: Option<DreamPath>,
    pub is_const: bool,
    pub is_final: bool,
    pub is_global: bool,
    pub is_tmp: bool,
    /// The default-value expression, owned by the tree after the build
    /// phase; evaluation is deferred to serialization.
    pub value: Option<Expr>,
    pub val_type: Option<u32>,
}

impl Variable {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decl_type: None,
            is_const: false,
            is_final: false,
            is_global: false,
            is_tmp: false,
            value: None,
            val_type: None,
        }
    }
}

/// One parameter of a compiled proc.
#[derive(Debug, Clone)]
pub struct ProcParameter {
    pub name: String,
    pub type_path: Option<DreamPath>,
    pub default: Option<Expr>,
    pub value_type: u32,
}

/// A bytecode source-info entry: the line active from `offset` on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    pub offset: u32,
    pub line: u32,
}

/// A compiled procedure.
#[derive(Debug)]
pub struct Proc {
    pub id: ProcId,
    pub name: String,
    pub owner: TypeId,
    pub is_verb: bool,
    pub parameters: Vec<ProcParameter>,
    /// The statement body, present until bytecode emission consumes it.
    pub body: Option<Vec<Stmt>>,
    pub bytecode: Vec<u8>,
    pub max_stack: u16,
    pub source_info: Vec<SourceInfo>,
    pub location: Location,
    pub verb_name: Option<String>,
    pub verb_category: Option<String>,
    pub verb_desc: Option<String>,
    pub verb_src: Option<i32>,
    pub invisibility: u8,
    pub attributes: u32,
}

/// A type in the lattice.
#[derive(Debug)]
pub struct Object {
    pub id: TypeId,
    pub path: DreamPath,
    pub parent: Option<TypeId>,
    pub variables: IndexMap<String, Variable>,
    pub variable_overrides: IndexMap<String, Variable>,
    /// Proc name to definition-ordered ids; order drives parent-proc
    /// resolution.
    pub procs: IndexMap<String, Vec<ProcId>>,
    pub init_proc: Option<ProcId>,
    pub from_standard: bool,
}

impl Object {
    #[must_use]
    pub fn has_proc(&self, name: &str) -> bool {
        self.procs.contains_key(name)
    }
}

/// The compiled world: arenas of objects and procs plus the registries
/// serialization needs.
#[derive(Debug)]
pub struct ObjectTree {
    pub objects: Vec<Object>,
    pub procs: Vec<Proc>,
    pub globals: Vec<Variable>,
    pub strings: StringTable,
    pub resources: StringTable,
    pub global_procs: IndexMap<String, ProcId>,
    path_ids: AHashMap<DreamPath, TypeId>,
    no_standard: bool,
}

impl ObjectTree {
    /// Creates the tree with the root object and the eagerly created
    /// built-in base types.
    #[must_use]
    pub fn new(no_standard: bool) -> Self {
        let mut tree = Self {
            objects: Vec::new(),
            procs: Vec::new(),
            globals: Vec::new(),
            strings: StringTable::new(),
            resources: StringTable::new(),
            global_procs: IndexMap::new(),
            path_ids: AHashMap::new(),
            no_standard,
        };
        tree.get_or_create(&DreamPath::root());
        for builtin in ["list", "client", "datum", "world", "savefile"] {
            tree.get_or_create(&DreamPath::absolute([builtin]));
        }
        tree
    }

    #[must_use]
    pub fn root(&self) -> TypeId {
        TypeId(0)
    }

    #[must_use]
    pub fn object(&self, id: TypeId) -> &Object {
        &self.objects[id.index()]
    }

    pub fn object_mut(&mut self, id: TypeId) -> &mut Object {
        &mut self.objects[id.index()]
    }

    #[must_use]
    pub fn proc(&self, id: ProcId) -> &Proc {
        &self.procs[id.index()]
    }

    pub fn proc_mut(&mut self, id: ProcId) -> &mut Proc {
        &mut self.procs[id.index()]
    }

    /// Looks up a type by absolute path.
    #[must_use]
    pub fn lookup(&self, path: &DreamPath) -> Option<TypeId> {
        self.path_ids.get(path).copied()
    }

    /// Gets or creates the object at `path`, creating missing ancestors
    /// first so every parent id refers to an earlier object.
    pub fn get_or_create(&mut self, path: &DreamPath) -> TypeId {
        let path = normalize_absolute(path);
        if let Some(&id) = self.path_ids.get(&path) {
            return id;
        }
        let parent = self.determine_parent(&path);
        let id = TypeId(u32::try_from(self.objects.len()).expect("object arena exceeds u32 range"));
        self.objects.push(Object {
            id,
            path: path.clone(),
            parent,
            variables: IndexMap::new(),
            variable_overrides: IndexMap::new(),
            procs: IndexMap::new(),
            init_proc: None,
            from_standard: false,
        });
        self.path_ids.insert(path, id);
        id
    }

    fn determine_parent(&mut self, path: &DreamPath) -> Option<TypeId> {
        if path.is_root() {
            return None;
        }
        if path.elements.len() > 1 {
            let parent = path.remove_last();
            return Some(self.get_or_create(&parent));
        }
        // Single-element paths: a fixed set of base types hangs off the
        // root; everything else defaults to /datum unless the standard
        // library is suppressed.
        let element = path.elements[0].as_str();
        let base_types = [
            "client", "datum", "list", "alist", "vector", "savefile", "world", "callee",
        ];
        if base_types.contains(&element) || self.no_standard {
            return Some(self.get_or_create(&DreamPath::root()));
        }
        Some(self.get_or_create(&DreamPath::absolute(["datum"])))
    }

    /// Resolves a path to a type in the context of `context` (for relative
    /// paths), using upward search through the ancestor scopes.
    #[must_use]
    pub fn resolve_type(&self, path: &DreamPath, context: Option<TypeId>) -> Option<TypeId> {
        if path.kind == PathKind::Absolute {
            if let Some(id) = self.lookup(path) {
                return Some(id);
            }
            // Fall back to a root-level type of the same trailing name,
            // which handles nested references like /client/C.
            if path.elements.len() > 1 {
                let last = path.elements.last().cloned()?;
                return self.lookup(&DreamPath::absolute([last]));
            }
            return None;
        }

        if let Some(context) = context {
            let combined = self.object(context).path.combine(path);
            if let Some(id) = self.lookup(&normalize_absolute(&combined)) {
                return Some(id);
            }
            if let Some(found) = self.upward_search(&self.object(context).path, path) {
                return self.lookup(&found);
            }
        }

        let absolute = DreamPath {
            kind: PathKind::Absolute,
            elements: path.elements.clone(),
        };
        self.lookup(&absolute)
    }

    /// Walks ancestor scopes of `from` looking for `search` to resolve.
    #[must_use]
    pub fn upward_search(&self, from: &DreamPath, search: &DreamPath) -> Option<DreamPath> {
        let mut current = normalize_absolute(from);
        loop {
            let combined = normalize_absolute(&current.combine(search));
            if self.path_ids.contains_key(&combined) {
                return Some(combined);
            }
            if current.elements.is_empty() {
                return None;
            }
            current = current.remove_last();
        }
    }

    /// Creates a proc, registering it on its owner (and globally when the
    /// owner is the root type).
    pub fn create_proc(&mut self, name: &str, owner: TypeId, is_verb: bool, location: Location) -> ProcId {
        let id = ProcId(u32::try_from(self.procs.len()).expect("proc arena exceeds u32 range"));
        self.procs.push(Proc {
            id,
            name: name.to_owned(),
            owner,
            is_verb,
            parameters: Vec::new(),
            body: None,
            bytecode: Vec::new(),
            max_stack: 0,
            source_info: Vec::new(),
            location,
            verb_name: None,
            verb_category: None,
            verb_desc: None,
            verb_src: None,
            invisibility: 0,
            attributes: proc_attributes::NONE,
        });
        self.objects[owner.index()]
            .procs
            .entry(name.to_owned())
            .or_default()
            .push(id);
        if owner == self.root() {
            self.global_procs.insert(name.to_owned(), id);
        }
        id
    }

    #[must_use]
    pub fn global_proc(&self, name: &str) -> Option<ProcId> {
        self.global_procs.get(name).copied()
    }

    /// Looks a proc up by name on a type, walking the ancestor chain.
    #[must_use]
    pub fn proc_in_chain(&self, mut type_id: TypeId, name: &str) -> Option<ProcId> {
        loop {
            let object = self.object(type_id);
            if let Some(ids) = object.procs.get(name) {
                if let Some(&id) = ids.first() {
                    return Some(id);
                }
            }
            type_id = object.parent?;
        }
    }

    /// Finds the nearest definition of a variable on `type_id` or its
    /// ancestors (definitions only, not overrides).
    #[must_use]
    pub fn var_in_chain(&self, mut type_id: TypeId, name: &str) -> Option<(TypeId, &Variable)> {
        loop {
            let object = self.object(type_id);
            if let Some(variable) = object.variables.get(name) {
                return Some((type_id, variable));
            }
            type_id = object.parent?;
        }
    }

    /// Adds a global variable, returning its index. Names are unique;
    /// re-adding returns the existing slot.
    pub fn add_global(&mut self, variable: Variable) -> usize {
        if let Some(index) = self.global_index(&variable.name) {
            self.globals[index] = variable;
            return index;
        }
        self.globals.push(variable);
        self.globals.len() - 1
    }

    #[must_use]
    pub fn global_index(&self, name: &str) -> Option<usize> {
        self.globals.iter().position(|g| g.name == name)
    }

    /// Installs an integer constant in the globals list unless the name is
    /// already taken. Used by the standard-library constant loader.
    pub fn add_global_constant(&mut self, name: &str, value: i64) {
        if self.global_index(name).is_some() {
            return;
        }
        let mut variable = Variable::named(name);
        variable.is_const = true;
        variable.is_global = true;
        variable.val_type = Some(value_type::NUM);
        variable.value = Some(Expr::new(Location::INTERNAL, crate::ast::ExprKind::Int(value)));
        self.globals.push(variable);
    }

    /// Marks every object created so far as part of the standard library.
    pub fn mark_standard(&mut self) {
        for object in &mut self.objects {
            object.from_standard = true;
        }
    }
}

/// Converts a path to its canonical absolute form used as a map key.
fn normalize_absolute(path: &DreamPath) -> DreamPath {
    if path.kind == PathKind::Absolute {
        return path.clone();
    }
    DreamPath {
        kind: PathKind::Absolute,
        elements: path.elements.clone(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn root_and_builtins_exist_eagerly() {
        let tree = ObjectTree::new(false);
        assert!(tree.lookup(&DreamPath::root()).is_some());
        for builtin in ["list", "client", "datum", "world", "savefile"] {
            assert!(tree.lookup(&DreamPath::absolute([builtin])).is_some(), "{builtin} missing");
        }
    }

    #[test]
    fn parents_are_created_before_children() {
        let mut tree = ObjectTree::new(false);
        let player = tree.get_or_create(&DreamPath::absolute(["mob", "player", "wizard"]));
        for object in &tree.objects {
            if let Some(parent) = object.parent {
                assert!(parent.index() < object.id.index(), "parent created after child");
            }
        }
        let parent = tree.object(player).parent.unwrap();
        assert_eq!(tree.object(parent).path.to_string(), "/mob/player");
    }

    #[test]
    fn single_element_types_parent_to_datum() {
        let mut tree = ObjectTree::new(false);
        let mob = tree.get_or_create(&DreamPath::absolute(["mob"]));
        let datum = tree.lookup(&DreamPath::absolute(["datum"])).unwrap();
        assert_eq!(tree.object(mob).parent, Some(datum));
    }

    #[test]
    fn no_standard_parents_to_root() {
        let mut tree = ObjectTree::new(true);
        let mob = tree.get_or_create(&DreamPath::absolute(["mob"]));
        assert_eq!(tree.object(mob).parent, Some(tree.root()));
    }

    #[test]
    fn reinsertion_returns_existing_id() {
        let mut tree = ObjectTree::new(false);
        let a = tree.get_or_create(&DreamPath::absolute(["obj", "foo"]));
        let b = tree.get_or_create(&DreamPath::absolute(["obj", "foo"]));
        assert_eq!(a, b);
    }

    #[test]
    fn root_procs_register_globally() {
        let mut tree = ObjectTree::new(false);
        let root = tree.root();
        let id = tree.create_proc("main", root, false, Location::INTERNAL);
        assert_eq!(tree.global_proc("main"), Some(id));
    }

    #[test]
    fn proc_lookup_walks_ancestors() {
        let mut tree = ObjectTree::new(false);
        let mob = tree.get_or_create(&DreamPath::absolute(["mob"]));
        let player = tree.get_or_create(&DreamPath::absolute(["mob", "player"]));
        let id = tree.create_proc("hit", mob, false, Location::INTERNAL);
        assert_eq!(tree.proc_in_chain(player, "hit"), Some(id));
        assert_eq!(tree.proc_in_chain(player, "missing"), None);
    }

    #[test]
    fn var_lookup_walks_ancestors() {
        let mut tree = ObjectTree::new(false);
        let mob = tree.get_or_create(&DreamPath::absolute(["mob"]));
        let player = tree.get_or_create(&DreamPath::absolute(["mob", "player"]));
        tree.object_mut(mob).variables.insert("health".to_owned(), Variable::named("health"));
        let (owner, _) = tree.var_in_chain(player, "health").unwrap();
        assert_eq!(owner, mob);
    }

    #[test]
    fn upward_search_finds_sibling_scope() {
        let mut tree = ObjectTree::new(false);
        tree.get_or_create(&DreamPath::absolute(["mob", "enemy"]));
        tree.get_or_create(&DreamPath::absolute(["mob", "player"]));
        let found = tree
            .upward_search(&DreamPath::absolute(["mob", "player"]), &DreamPath::relative(["enemy"]))
            .unwrap();
        assert_eq!(found.to_string(), "/mob/enemy");
    }

    #[test]
    fn global_constants_do_not_duplicate() {
        let mut tree = ObjectTree::new(false);
        tree.add_global_constant("NORTH", 1);
        tree.add_global_constant("NORTH", 99);
        assert_eq!(tree.globals.len(), 1);
        let value = tree.globals[0].value.as_ref().unwrap().try_const().unwrap();
        assert_eq!(value, crate::ast::ConstValue::Int(1));
    }
}
