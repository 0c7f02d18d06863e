//! Serialization of the compiled world into the output JSON artifact.
//!
//! Top-level field order is fixed: Metadata, Strings, Resources,
//! GlobalProcs, Globals, Types, Procs, Maps, Interface, OptionalErrors.
//! `serde_json`'s `preserve_order` feature keeps maps in insertion order,
//! so the artifact is byte-for-byte deterministic for identical inputs.

use serde_json::{json, Map, Value};

use crate::{
    ast::{ConstValue, Expr},
    diagnostics::Diagnostics,
    dmm::DreamMap,
    intern::StringTable,
    objtree::{Object, ObjectTree, Proc},
};

/// Builds the complete output document.
pub fn build_output(
    tree: &mut ObjectTree,
    diag: &Diagnostics,
    maps: &[DreamMap],
    interface: Option<&str>,
) -> Value {
    intern_constant_resources(tree);

    let mut root = Map::new();

    root.insert(
        "Metadata".to_owned(),
        json!({ "Version": format!("dreamc-{}", env!("CARGO_PKG_VERSION")) }),
    );

    root.insert(
        "Strings".to_owned(),
        Value::Array(tree.strings.iter().map(Value::from).collect()),
    );

    if !tree.resources.is_empty() {
        root.insert(
            "Resources".to_owned(),
            Value::Array(tree.resources.iter().map(Value::from).collect()),
        );
    }

    if !tree.global_procs.is_empty() {
        root.insert(
            "GlobalProcs".to_owned(),
            Value::Array(tree.global_procs.values().map(|id| Value::from(id.raw())).collect()),
        );
    }

    if !tree.globals.is_empty() {
        let mut globals_obj = Map::new();
        globals_obj.insert("GlobalCount".to_owned(), Value::from(tree.globals.len()));
        globals_obj.insert(
            "Names".to_owned(),
            Value::Array(tree.globals.iter().map(|g| Value::from(g.name.as_str())).collect()),
        );
        let mut values = Map::new();
        for global in &tree.globals {
            values.insert(global.name.clone(), value_json(global.value.as_ref(), &tree.resources));
        }
        globals_obj.insert("Globals".to_owned(), Value::Object(values));
        root.insert("Globals".to_owned(), Value::Object(globals_obj));
    }

    root.insert(
        "Types".to_owned(),
        Value::Array(tree.objects.iter().map(|object| type_record(object, tree)).collect()),
    );

    root.insert(
        "Procs".to_owned(),
        Value::Array(tree.procs.iter().map(proc_record).collect()),
    );

    if !maps.is_empty() {
        root.insert(
            "Maps".to_owned(),
            serde_json::to_value(maps).unwrap_or(Value::Null),
        );
    }
    if let Some(interface) = interface {
        root.insert("Interface".to_owned(), Value::from(interface));
    }

    let mut optional = Map::new();
    for (code, level) in diag.optional_error_levels() {
        optional.insert(code.to_string(), Value::from(level as i64));
    }
    root.insert("OptionalErrors".to_owned(), Value::Object(optional));

    Value::Object(root)
}

/// Interns the resource paths reachable from constant variable defaults so
/// the `Resources` array is complete before values are encoded.
fn intern_constant_resources(tree: &mut ObjectTree) {
    let mut paths: Vec<String> = Vec::new();
    let mut collect = |value: Option<&Expr>| {
        if let Some(ConstValue::Resource(path)) = value.and_then(Expr::try_const) {
            paths.push(path);
        }
    };
    for object in &tree.objects {
        for variable in object.variables.values().chain(object.variable_overrides.values()) {
            collect(variable.value.as_ref());
        }
    }
    for global in &tree.globals {
        collect(global.value.as_ref());
    }
    for path in paths {
        tree.resources.intern(&path);
    }
}

fn type_record(object: &Object, tree: &ObjectTree) -> Value {
    let mut record = Map::new();
    record.insert("Path".to_owned(), Value::from(object.path.to_string()));
    if let Some(parent) = object.parent {
        record.insert("Parent".to_owned(), Value::from(parent.raw()));
    }
    if let Some(init_proc) = object.init_proc {
        record.insert("InitProc".to_owned(), Value::from(init_proc.raw()));
    }

    if !object.procs.is_empty() {
        let groups: Vec<Value> = object
            .procs
            .values()
            .map(|ids| Value::Array(ids.iter().map(|id| Value::from(id.raw())).collect()))
            .collect();
        record.insert("Procs".to_owned(), Value::Array(groups));
    }

    if !object.variables.is_empty() || !object.variable_overrides.is_empty() {
        let mut variables = Map::new();
        for variable in object.variables.values() {
            variables.insert(variable.name.clone(), value_json(variable.value.as_ref(), &tree.resources));
        }
        for variable in object.variable_overrides.values() {
            variables.insert(variable.name.clone(), value_json(variable.value.as_ref(), &tree.resources));
        }
        record.insert("Variables".to_owned(), Value::Object(variables));
    }

    let const_variables: Vec<Value> = object
        .variables
        .values()
        .filter(|v| v.is_const)
        .map(|v| Value::from(v.name.as_str()))
        .collect();
    if !const_variables.is_empty() {
        record.insert("ConstVariables".to_owned(), Value::Array(const_variables));
    }

    let tmp_variables: Vec<Value> = object
        .variables
        .values()
        .filter(|v| v.is_tmp)
        .map(|v| Value::from(v.name.as_str()))
        .collect();
    if !tmp_variables.is_empty() {
        record.insert("TmpVariables".to_owned(), Value::Array(tmp_variables));
    }

    Value::Object(record)
}

fn proc_record(proc: &Proc) -> Value {
    let mut record = Map::new();
    record.insert("OwningTypeId".to_owned(), Value::from(proc.owner.raw()));
    record.insert("Name".to_owned(), Value::from(proc.name.as_str()));
    record.insert("Attributes".to_owned(), Value::from(proc.attributes));
    record.insert("MaxStackSize".to_owned(), Value::from(proc.max_stack));

    if !proc.parameters.is_empty() {
        let arguments: Vec<Value> = proc
            .parameters
            .iter()
            .map(|parameter| {
                json!({
                    "Name": parameter.name.as_str(),
                    "Type": parameter.value_type,
                })
            })
            .collect();
        record.insert("Arguments".to_owned(), Value::Array(arguments));
    }

    let source_info: Vec<Value> = if proc.source_info.is_empty() {
        vec![json!({ "Offset": 0, "Line": proc.location.line })]
    } else {
        proc.source_info
            .iter()
            .map(|entry| json!({ "Offset": entry.offset, "Line": entry.line }))
            .collect()
    };
    record.insert("SourceInfo".to_owned(), Value::Array(source_info));

    if !proc.bytecode.is_empty() {
        record.insert(
            "Bytecode".to_owned(),
            Value::Array(proc.bytecode.iter().map(|b| Value::from(*b)).collect()),
        );
    }

    record.insert("IsVerb".to_owned(), Value::from(proc.is_verb));
    if proc.is_verb {
        if let Some(src) = proc.verb_src {
            record.insert("VerbSrc".to_owned(), Value::from(src));
        }
        if let Some(name) = &proc.verb_name {
            record.insert("VerbName".to_owned(), Value::from(name.as_str()));
        }
        if let Some(category) = &proc.verb_category {
            record.insert("VerbCategory".to_owned(), Value::from(category.as_str()));
        }
        if let Some(desc) = &proc.verb_desc {
            record.insert("VerbDesc".to_owned(), Value::from(desc.as_str()));
        }
        record.insert("Invisibility".to_owned(), Value::from(proc.invisibility));
    }

    Value::Object(record)
}

/// Encodes a variable default. Values that are not compile-time constants
/// serialize as null; their assignment happens in the type's init proc.
fn value_json(value: Option<&Expr>, resources: &StringTable) -> Value {
    let Some(constant) = value.and_then(Expr::try_const) else {
        return Value::Null;
    };
    const_json(&constant, resources)
}

/// The JSON encoding of literals: null, numbers (with infinity objects),
/// strings, resource references, and path strings.
pub fn const_json(value: &ConstValue, resources: &StringTable) -> Value {
    match value {
        ConstValue::Null => Value::Null,
        ConstValue::Int(i) => Value::from(*i),
        ConstValue::Float(f) => {
            if f.is_infinite() {
                let kind = if *f > 0.0 { "PositiveInfinity" } else { "NegativeInfinity" };
                json!({ "type": kind })
            } else if f.is_nan() {
                Value::Null
            } else {
                Value::from(*f)
            }
        }
        ConstValue::Str(s) => Value::from(s.as_str()),
        ConstValue::Resource(path) => {
            let id = resources.id_of(path).map_or(0, |id| id.raw());
            json!({ "type": "resource", "id": id })
        }
        ConstValue::Path(path) => Value::from(path.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn infinity_encodes_as_typed_object() {
        let resources = StringTable::new();
        let value = const_json(&ConstValue::Float(f64::INFINITY), &resources);
        assert_eq!(value, json!({ "type": "PositiveInfinity" }));
        let value = const_json(&ConstValue::Float(f64::NEG_INFINITY), &resources);
        assert_eq!(value, json!({ "type": "NegativeInfinity" }));
    }

    #[test]
    fn resource_encodes_with_id() {
        let mut resources = StringTable::new();
        resources.intern("icons/mob.dmi");
        let value = const_json(&ConstValue::Resource("icons/mob.dmi".to_owned()), &resources);
        assert_eq!(value, json!({ "type": "resource", "id": 0 }));
    }

    #[test]
    fn top_level_field_order() {
        let mut tree = ObjectTree::new(false);
        tree.add_global_constant("TRUE", 1);
        let diag = Diagnostics::new(100, false);
        let output = build_output(&mut tree, &diag, &[], None);
        let Value::Object(map) = &output else { panic!("expected object") };
        let keys: Vec<&String> = map.keys().collect();
        assert_eq!(
            keys,
            vec!["Metadata", "Strings", "Globals", "Types", "Procs", "OptionalErrors"]
        );
    }
}
