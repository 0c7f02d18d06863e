//! End-to-end pipeline tests over in-memory sources: the behaviors a
//! compiled world must exhibit, plus output-wide properties like
//! determinism and stack-depth well-formedness.

use dreamc::{compile_source, simulate_max_stack, Diagnostics, Settings};
use pretty_assertions::assert_eq;
use serde_json::Value;

fn compile(source: &str) -> (Value, Diagnostics) {
    compile_source("test.dm", source, Settings::default())
}

fn find_type<'v>(output: &'v Value, path: &str) -> &'v Value {
    output["Types"]
        .as_array()
        .expect("Types array")
        .iter()
        .find(|t| t["Path"] == path)
        .unwrap_or_else(|| panic!("type {path} not found"))
}

fn type_index(output: &Value, path: &str) -> u64 {
    output["Types"]
        .as_array()
        .expect("Types array")
        .iter()
        .position(|t| t["Path"] == path)
        .unwrap_or_else(|| panic!("type {path} not found")) as u64
}

fn find_proc<'v>(output: &'v Value, name: &str) -> &'v Value {
    output["Procs"]
        .as_array()
        .expect("Procs array")
        .iter()
        .find(|p| p["Name"] == name)
        .unwrap_or_else(|| panic!("proc {name} not found"))
}

#[test]
fn root_variable_with_constant_folding() {
    let (output, diag) = compile("var/x = 1 + 2\n");
    assert_eq!(diag.error_count(), 0);
    let root = find_type(&output, "/");
    assert_eq!(root["Variables"]["x"], Value::from(3));
}

#[test]
fn macro_expansion_feeds_folding() {
    let (output, diag) = compile("#define SQ(x) ((x)*(x))\nvar/y = SQ(3+1)\n");
    assert_eq!(diag.error_count(), 0);
    let root = find_type(&output, "/");
    assert_eq!(root["Variables"]["y"], Value::from(16));
}

#[test]
fn conditional_compilation_selects_branch() {
    let (output, diag) = compile("#if 0\nvar/a = 1\n#else\nvar/b = 2\n#endif\n");
    assert_eq!(diag.error_count(), 0);
    let root = find_type(&output, "/");
    assert_eq!(root["Variables"]["b"], Value::from(2));
    assert!(root["Variables"].get("a").is_none());
}

#[test]
fn proc_definition_compiles_to_bytecode() {
    let (output, diag) = compile("/mob/player/proc/hi()\n\treturn 42\n");
    assert_eq!(diag.error_count(), 0);
    let player = find_type(&output, "/mob/player");
    assert_eq!(player["Parent"], Value::from(type_index(&output, "/mob")));
    let hi = find_proc(&output, "hi");
    assert!(!hi["Bytecode"].as_array().expect("bytecode").is_empty());
    assert!(hi["MaxStackSize"].as_u64().expect("max stack") >= 1);
}

#[test]
fn constant_division_by_zero_still_produces_output() {
    let (output, diag) = compile("proc/bad()\n\treturn 1 / 0\n");
    assert!(diag.warning_count() >= 1);
    assert_eq!(diag.error_count(), 0);
    // The division stays in the bytecode as a runtime operation.
    let bad = find_proc(&output, "bad");
    assert!(!bad["Bytecode"].as_array().expect("bytecode").is_empty());
}

#[test]
fn zero_token_input_is_an_error_not_a_crash() {
    let (_, diag) = compile("");
    assert!(diag.error_count() >= 1);
    assert!(diag.messages().iter().any(|m| m.contains("No tokens to parse")));
}

#[test]
fn self_expanding_macro_is_left_as_identifier() {
    // The macro never resolves, so the identifier reaches the emitter and
    // the proc is abandoned with a warning; compilation still finishes.
    let (output, diag) = compile("#define loop loop\nproc/f()\n\treturn loop\n");
    assert!(diag.warning_count() >= 1);
    let f = find_proc(&output, "f");
    assert!(f.get("Bytecode").is_none());
}

#[test]
fn abandoned_proc_keeps_empty_bytecode() {
    // break outside of a loop abandons the proc the same way a stack
    // imbalance would.
    let (output, diag) = compile("proc/f()\n\tbreak\nproc/g()\n\treturn 1\n");
    assert!(diag.warning_count() >= 1);
    let f = find_proc(&output, "f");
    assert!(f.get("Bytecode").is_none());
    assert_eq!(f["MaxStackSize"], Value::from(0));
    // The sibling proc still compiled.
    assert!(!find_proc(&output, "g")["Bytecode"].as_array().expect("bytecode").is_empty());
}

#[test]
fn output_is_deterministic() {
    let source = "#define HP 50\nmob/var/health = HP\nmob/player\n\thealth = 100\n/mob/player/proc/hi(n)\n\treturn n + 1\nvar/greeting = \"hello \" + \"world\"\n";
    let (first, _) = compile(source);
    let (second, _) = compile(source);
    assert_eq!(
        serde_json::to_string(&first).expect("serializes"),
        serde_json::to_string(&second).expect("serializes")
    );
}

#[test]
fn max_stack_matches_symbolic_simulation() {
    let source = "\
var/score = 0
mob/var/health = 100
mob/player
\thealth = 50
proc/helper(a, b = 2)
\treturn a + b
/mob/proc/logic(x, L)
\tvar/total = 0
\tif(x > 10 && x < 100)
\t\ttotal += x
\telse if(!x)
\t\ttotal = 1 ? 2 : 3
\tfor(var/i = 1 to 10 step 2)
\t\ttotal += i
\tfor(var/item in L)
\t\ttotal++
\twhile(total > 200)
\t\ttotal--
\tdo
\t\ttotal += 1
\twhile(total < 5)
\tswitch(x)
\t\tif(1)
\t\t\ttotal = 10
\t\tif(5 to 9)
\t\t\ttotal = 20
\t\telse
\t\t\ttotal = 30
\tspawn(10)
\t\ttotal = 0
\ttry
\t\tthrow \"bad\"
\tcatch(var/e)
\t\ttotal = 99
\tscore = total
\thealth = helper(total)
\treturn total
";
    let (output, diag) = compile(source);
    assert_eq!(diag.error_count(), 0, "{:?}", diag.messages());
    for proc in output["Procs"].as_array().expect("Procs array") {
        let Some(bytecode) = proc.get("Bytecode").and_then(Value::as_array) else {
            continue;
        };
        let bytes: Vec<u8> = bytecode
            .iter()
            .map(|b| u8::try_from(b.as_u64().expect("byte")).expect("byte range"))
            .collect();
        let simulated = simulate_max_stack(&bytes)
            .unwrap_or_else(|| panic!("proc {} has ill-formed bytecode", proc["Name"]));
        assert_eq!(
            u64::from(simulated),
            proc["MaxStackSize"].as_u64().expect("max stack"),
            "stack mismatch in proc {}",
            proc["Name"]
        );
    }
}

#[test]
fn string_table_is_dense_and_distinct() {
    let source = "proc/f()\n\treturn \"alpha\" + \"beta\"\nproc/g()\n\treturn \"alpha\"\n";
    let (output, _) = compile(source);
    let strings = output["Strings"].as_array().expect("Strings array");
    let mut seen = std::collections::HashSet::new();
    for s in strings {
        assert!(seen.insert(s.as_str().expect("string")), "duplicate interned string {s}");
    }
    assert!(seen.contains("alpha"));
    assert!(seen.contains("beta"));
}

#[test]
fn globals_section_lists_names_and_values() {
    let (output, diag) = compile("/global/var/score = 7\n/global/var/title = \"king\"\n");
    assert_eq!(diag.error_count(), 0);
    let globals = &output["Globals"];
    assert_eq!(globals["GlobalCount"], Value::from(2));
    assert_eq!(globals["Names"][0], Value::from("score"));
    assert_eq!(globals["Globals"]["score"], Value::from(7));
    assert_eq!(globals["Globals"]["title"], Value::from("king"));
}

#[test]
fn global_procs_are_listed() {
    let (output, _) = compile("proc/alpha()\n\treturn 1\nproc/beta()\n\treturn alpha()\n");
    let ids = output["GlobalProcs"].as_array().expect("GlobalProcs");
    assert_eq!(ids.len(), 2);
}

#[test]
fn verbs_serialize_their_metadata() {
    let source = "mob/verb/wave()\n\tset name = \"Wave\"\n\tset desc = \"Wave hello\"\n\tset category = \"Social\"\n\treturn\n";
    let (output, diag) = compile(source);
    assert_eq!(diag.error_count(), 0);
    let wave = find_proc(&output, "wave");
    assert_eq!(wave["IsVerb"], Value::from(true));
    assert_eq!(wave["VerbName"], Value::from("Wave"));
    assert_eq!(wave["VerbCategory"], Value::from("Social"));
    assert_eq!(wave["VerbDesc"], Value::from("Wave hello"));
    assert_eq!(wave["Invisibility"], Value::from(0));
}

#[test]
fn verb_arguments_carry_type_flags() {
    let (output, _) = compile("mob/verb/tell(msg as text, target as mob)\n\treturn\n");
    let tell = find_proc(&output, "tell");
    assert_eq!(tell["Arguments"][0]["Type"], Value::from(2));
    assert_eq!(tell["Arguments"][1]["Type"], Value::from(8));
}

#[test]
fn non_constant_defaults_move_to_init_proc() {
    let source = "mob/var/list/inventory = new /list(4)\n";
    let (output, diag) = compile(source);
    assert_eq!(diag.error_count(), 0);
    let mob = find_type(&output, "/mob");
    // The default is not a compile-time constant.
    assert_eq!(mob["Variables"]["inventory"], Value::Null);
    let init_proc = mob["InitProc"].as_u64().expect("InitProc id");
    let init = &output["Procs"].as_array().expect("Procs")[usize::try_from(init_proc).expect("index")];
    assert_eq!(init["Name"], Value::from("<init>"));
    assert!(!init["Bytecode"].as_array().expect("bytecode").is_empty());
}

#[test]
fn resources_intern_into_the_output() {
    let (output, diag) = compile("mob/var/icon_file = 'icons/mob.dmi'\n");
    assert_eq!(diag.error_count(), 0);
    assert_eq!(output["Resources"][0], Value::from("icons/mob.dmi"));
    let mob = find_type(&output, "/mob");
    assert_eq!(mob["Variables"]["icon_file"]["type"], Value::from("resource"));
    assert_eq!(mob["Variables"]["icon_file"]["id"], Value::from(0));
}

#[test]
fn const_and_tmp_variables_are_listed() {
    let (output, _) = compile("mob/var/const/MAX = 10\nmob/var/tmp/cache\n");
    let mob = find_type(&output, "/mob");
    assert_eq!(mob["ConstVariables"][0], Value::from("MAX"));
    assert_eq!(mob["TmpVariables"][0], Value::from("cache"));
}

#[test]
fn optional_errors_cover_the_runtime_range() {
    let (output, _) = compile("var/x = 1\n");
    let optional = output["OptionalErrors"].as_object().expect("OptionalErrors");
    for code in optional.keys() {
        let code: u16 = code.parse().expect("numeric code");
        assert!((4000..=4999).contains(&code));
    }
    assert!(!optional.is_empty());
}

#[test]
fn format_strings_compile() {
    let (output, diag) = compile("proc/describe(n)\n\treturn \"value: [n + 1]!\"\n");
    assert_eq!(diag.error_count(), 0);
    let describe = find_proc(&output, "describe");
    assert!(!describe["Bytecode"].as_array().expect("bytecode").is_empty());
}

#[test]
fn unknown_variable_abandons_only_that_proc() {
    let (output, diag) = compile("proc/broken()\n\treturn never_defined\nproc/fine()\n\treturn 5\n");
    assert!(diag.warning_count() >= 1);
    assert!(find_proc(&output, "broken").get("Bytecode").is_none());
    assert!(find_proc(&output, "fine").get("Bytecode").is_some());
}

#[test]
fn parent_call_and_override_chain() {
    let source = "mob/proc/act()\n\treturn 1\nmob/player/act()\n\treturn ..() + 1\n";
    let (output, diag) = compile(source);
    assert_eq!(diag.error_count(), 0);
    let player = find_type(&output, "/mob/player");
    let groups = player["Procs"].as_array().expect("proc groups");
    assert_eq!(groups.len(), 1);
    let mob = find_type(&output, "/mob");
    assert_eq!(mob["Procs"].as_array().expect("proc groups").len(), 1);
}

#[test]
fn metadata_and_field_order() {
    let (output, _) = compile("var/x = 1\n");
    let object = output.as_object().expect("object");
    let keys: Vec<&String> = object.keys().collect();
    let expected_prefix = ["Metadata", "Strings"];
    for (i, key) in expected_prefix.iter().enumerate() {
        assert_eq!(keys[i], key);
    }
    assert_eq!(*keys.last().expect("nonempty"), "OptionalErrors");
    assert!(output["Metadata"]["Version"].as_str().expect("version").starts_with("dreamc-"));
}
