use std::{env, path::PathBuf, process::ExitCode};

use dreamc::{Compiler, Settings};

fn print_help() {
    println!("dreamc - a Dream Maker compiler");
    println!("\nUsage: dreamc [options] [file].dme\n");
    println!("Options and arguments:");
    println!("  --help                    : Show this help");
    println!("  --version [VER].[BUILD]   : Set the DM_VERSION and DM_BUILD macros");
    println!("  --skip-bad-args           : Skip arguments the compiler doesn't recognize");
    println!("  --suppress-unimplemented  : Do not warn about unimplemented proc and var uses");
    println!("  --suppress-unsupported    : Do not warn about unsupported proc and var uses");
    println!("  --dump-preprocessor       : Save the result of preprocessing to a file");
    println!("  --no-standard             : Disable the built-in standard library");
    println!("  --define [KEY=VAL]        : Add extra defines to the compilation");
    println!("  --lib-path [PATH]         : Add a path to search for external libraries");
    println!("  --verbose                 : Show verbose output during compile");
    println!("  --notices-enabled         : Show notice output during compile");
    println!("  --no-opts                 : Disable compiler optimizations");
    println!("  --skip-anything-typecheck : Skip `as anything` type checks");
}

fn parse_arguments(args: &[String]) -> Option<Settings> {
    let mut settings = Settings::default();
    let mut skip_bad_args = false;

    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                return None;
            }
            "--skip-bad-args" => skip_bad_args = true,
            "--suppress-unimplemented" => settings.suppress_unimplemented = true,
            "--suppress-unsupported" => settings.suppress_unsupported = true,
            "--dump-preprocessor" => settings.dump_preprocessor = true,
            "--no-standard" => settings.no_standard = true,
            "--verbose" => settings.verbose = true,
            "--notices-enabled" => settings.notices_enabled = true,
            "--no-opts" => settings.no_opts = true,
            "--skip-anything-typecheck" => settings.skip_anything_typecheck = true,
            "--version" => {
                let Some(version) = iter.next() else {
                    eprintln!("--version requires a value like 515.1655");
                    return None;
                };
                let mut parts = version.splitn(2, '.');
                if let Some(ver) = parts.next().and_then(|v| v.parse().ok()) {
                    settings.dm_version = ver;
                }
                if let Some(build) = parts.next().and_then(|v| v.parse().ok()) {
                    settings.dm_build = build;
                }
            }
            "--define" => {
                let Some(define) = iter.next() else {
                    eprintln!("--define requires KEY or KEY=VAL");
                    return None;
                };
                match define.split_once('=') {
                    Some((key, value)) => settings.macro_defines.push((key.to_owned(), value.to_owned())),
                    None => settings.macro_defines.push((define.clone(), "1".to_owned())),
                }
            }
            "--lib-path" => {
                let Some(path) = iter.next() else {
                    eprintln!("--lib-path requires a path");
                    return None;
                };
                settings.lib_paths.push(PathBuf::from(path));
            }
            other if other.starts_with('-') => {
                if !skip_bad_args {
                    eprintln!("Unknown argument: {other}");
                    return None;
                }
            }
            file => {
                if file.ends_with(".dm") || file.ends_with(".dme") {
                    settings.files.push(PathBuf::from(file));
                } else if !skip_bad_args {
                    eprintln!("Invalid file extension: {file}");
                    return None;
                }
            }
        }
    }

    if settings.files.is_empty() {
        eprintln!("Error: No input files specified");
        eprintln!("Use --help for usage information");
        return None;
    }
    Some(settings)
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("Error: No input files specified");
        eprintln!("Use --help for usage information");
        return ExitCode::FAILURE;
    }

    let Some(settings) = parse_arguments(&args) else {
        return ExitCode::FAILURE;
    };

    let mut compiler = Compiler::new(settings);
    if compiler.compile() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
