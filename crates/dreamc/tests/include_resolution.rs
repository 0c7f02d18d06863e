//! File-based pipeline tests: include splicing, cycle detection, the map
//! side-channel, and artifact determinism across equivalent layouts.

use std::{
    fs,
    path::{Path, PathBuf},
};

use dreamc::{Compiler, Settings};
use pretty_assertions::assert_eq;
use serde_json::Value;

struct TestDir {
    root: PathBuf,
}

impl TestDir {
    fn new(name: &str) -> Self {
        let root = std::env::temp_dir().join(format!("dreamc-test-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).expect("create test dir");
        Self { root }
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.root.join(name);
        fs::write(&path, contents).expect("write test file");
        path
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn compile_file(path: &Path) -> (bool, Value) {
    let settings = Settings {
        files: vec![path.to_path_buf()],
        no_standard: true,
        ..Settings::default()
    };
    let mut compiler = Compiler::new(settings);
    let ok = compiler.compile();
    let json_path = path.with_extension("json");
    let value = fs::read_to_string(&json_path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or(Value::Null);
    (ok, value)
}

#[test]
fn include_splices_at_point_of_inclusion() {
    let dir = TestDir::new("splice");
    dir.write("items.dm", "/obj/foo\n\tvar/weight = 3\n");
    let root = dir.write("world.dme", "#include \"items.dm\"\nvar/x = 1\n");

    let (ok, output) = compile_file(&root);
    assert!(ok);
    let types = output["Types"].as_array().expect("Types");
    assert!(types.iter().any(|t| t["Path"] == "/obj/foo"));
}

#[test]
fn included_file_equals_concatenated_content() {
    let dir = TestDir::new("concat");
    dir.write("b.dm", "/obj/foo\n\tvar/weight = 3\n");
    let with_include = dir.write("a.dme", "#include \"b.dm\"\nvar/x = 1\n");
    let concatenated = dir.write("single.dme", "/obj/foo\n\tvar/weight = 3\nvar/x = 1\n");

    let (ok_a, output_a) = compile_file(&with_include);
    let (ok_b, output_b) = compile_file(&concatenated);
    assert!(ok_a && ok_b);
    assert_eq!(
        serde_json::to_string(&output_a).expect("serializes"),
        serde_json::to_string(&output_b).expect("serializes")
    );
}

#[test]
fn include_is_idempotent() {
    let dir = TestDir::new("idempotent");
    dir.write("b.dm", "/obj/foo\n\tvar/weight = 3\n");
    let root = dir.write("a.dme", "#include \"b.dm\"\n#include \"b.dm\"\n");

    let (ok, output) = compile_file(&root);
    assert!(ok);
    let foo_count = output["Types"]
        .as_array()
        .expect("Types")
        .iter()
        .filter(|t| t["Path"] == "/obj/foo")
        .count();
    assert_eq!(foo_count, 1);
}

#[test]
fn self_include_cycle_reports_chain() {
    let dir = TestDir::new("cycle");
    let root = dir.path("a.dme");
    dir.write("a.dme", "#include \"b.dm\"\n");
    dir.write("b.dm", "#include \"a.dme\"\n");

    let settings = Settings {
        files: vec![root.clone()],
        no_standard: true,
        ..Settings::default()
    };
    let mut compiler = Compiler::new(settings);
    let ok = compiler.compile();
    assert!(!ok);
    assert!(compiler
        .diag
        .messages()
        .iter()
        .any(|m| m.contains("Include cycle detected") && m.contains("a.dme")));
}

#[test]
fn missing_include_names_the_chain() {
    let dir = TestDir::new("missing");
    let root = dir.write("a.dme", "#include \"nope.dm\"\n");

    let settings = Settings {
        files: vec![root],
        no_standard: true,
        ..Settings::default()
    };
    let mut compiler = Compiler::new(settings);
    compiler.compile();
    assert!(compiler
        .diag
        .messages()
        .iter()
        .any(|m| m.contains("Could not find included file")));
}

#[test]
fn lib_path_resolves_includes() {
    let dir = TestDir::new("libpath");
    let libs = dir.path("libs");
    fs::create_dir_all(&libs).expect("create libs dir");
    fs::write(libs.join("shared.dm"), "/obj/shared\n").expect("write lib file");
    let root = dir.write("a.dme", "#include \"shared.dm\"\n");

    let settings = Settings {
        files: vec![root],
        lib_paths: vec![libs],
        no_standard: true,
        ..Settings::default()
    };
    let mut compiler = Compiler::new(settings);
    let ok = compiler.compile();
    assert!(ok);
    assert!(compiler.tree().lookup(&dreamc::DreamPath::absolute(["obj", "shared"])).is_some());
}

#[test]
fn maps_flow_through_the_side_channel() {
    let dir = TestDir::new("maps");
    dir.write(
        "level.dmm",
        "\"a\" = (/turf/floor)\n\"b\" = (/turf/wall)\n(1,1,1) = {\"\nab\nba\n\"}\n",
    );
    let root = dir.write("world.dme", "#include \"level.dmm\"\nturf/floor\nturf/wall\nvar/x = 1\n");

    let (ok, output) = compile_file(&root);
    assert!(ok);
    let maps = output["Maps"].as_array().expect("Maps");
    assert_eq!(maps.len(), 1);
    assert_eq!(maps[0]["MaxX"], Value::from(2));
    assert_eq!(maps[0]["Blocks"][0]["Cells"][0], Value::from("a"));
}

#[test]
fn interface_side_channel_latest_wins() {
    let dir = TestDir::new("interface");
    dir.write("one.dmf", "window \"main\"\n");
    dir.write("two.dmf", "window \"other\"\n");
    let root = dir.write("world.dme", "#include \"one.dmf\"\n#include \"two.dmf\"\nvar/x = 1\n");

    let (ok, output) = compile_file(&root);
    assert!(ok);
    let interface = output["Interface"].as_str().expect("Interface");
    assert!(interface.ends_with("two.dmf"));
}

#[test]
fn nested_includes_resolve_relative_to_including_file() {
    let dir = TestDir::new("nested");
    let sub = dir.path("sub");
    fs::create_dir_all(&sub).expect("create sub dir");
    fs::write(sub.join("inner.dm"), "/obj/inner\n").expect("write inner");
    fs::write(sub.join("outer.dm"), "#include \"inner.dm\"\n").expect("write outer");
    let root = dir.write("world.dme", "#include \"sub/outer.dm\"\nvar/x = 1\n");

    let (ok, output) = compile_file(&root);
    assert!(ok);
    assert!(output["Types"]
        .as_array()
        .expect("Types")
        .iter()
        .any(|t| t["Path"] == "/obj/inner"));
}

#[test]
fn exit_status_reflects_errors() {
    let dir = TestDir::new("status");
    let root = dir.write("bad.dme", "mob/player\n\tundefined_var = 1\n");

    let settings = Settings {
        files: vec![root],
        no_standard: true,
        ..Settings::default()
    };
    let mut compiler = Compiler::new(settings);
    assert!(!compiler.compile());
    assert!(compiler.diag.error_count() >= 1);
}
