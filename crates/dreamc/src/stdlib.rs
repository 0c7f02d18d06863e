//! Standard-library discovery and the `Defines.dm` constant scan.
//!
//! The bundled DMStandard lives in a `DMStandard/` directory next to the
//! compiler executable. `_Standard.dm` is preprocessed ahead of user files;
//! `Defines.dm` is additionally scanned for integer `#define` constants
//! which become global constants. A missing standard library is a warning,
//! never an error.

use std::path::PathBuf;

use crate::{diagnostics::Diagnostics, objtree::ObjectTree};

/// The directory holding the bundled standard library, next to the
/// executable. `None` when the executable path cannot be determined.
#[must_use]
pub fn standard_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join("DMStandard"))
}

/// Loads `Defines.dm` integer constants into the global list, plus the
/// lowercase boolean aliases DM code relies on.
pub fn install_constants(diag: &mut Diagnostics, tree: &mut ObjectTree) {
    let Some(dir) = standard_dir() else {
        diag.warning("Failed to get executable path for DMStandard initialization");
        return;
    };
    let defines = dir.join("Defines.dm");
    match std::fs::read_to_string(&defines) {
        Ok(source) => {
            for (name, value) in scan_defines(&source) {
                tree.add_global_constant(&name, value);
            }
        }
        Err(_) => {
            diag.warning(format!("DMStandard/Defines.dm not found at: {}", defines.display()));
        }
    }
    tree.add_global_constant("true", 1);
    tree.add_global_constant("false", 0);
}

/// Extracts integer `#define` constants: decimal, hex, `(1<<N)` shifts, and
/// the compound direction aliases whose values are bitwise combinations.
#[must_use]
pub fn scan_defines(source: &str) -> Vec<(String, i64)> {
    let mut constants = Vec::new();
    for line in source.lines() {
        let line = line.trim_start();
        let Some(rest) = line.strip_prefix("#define") else {
            continue;
        };
        let rest = rest.trim_start();
        let Some(name_end) = rest.find(|c: char| c.is_whitespace()) else {
            continue;
        };
        let name = &rest[..name_end];
        let mut value_str = rest[name_end..].trim();
        if let Some(comment) = value_str.find("//") {
            value_str = value_str[..comment].trim_end();
        }
        if value_str.is_empty() {
            continue;
        }

        if let Some(value) = parse_define_value(name, value_str) {
            constants.push((name.to_owned(), value));
        }
    }
    constants
}

fn parse_define_value(name: &str, value: &str) -> Option<i64> {
    if let Ok(decimal) = value.parse::<i64>() {
        return Some(decimal);
    }
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        if let Ok(hex) = i64::from_str_radix(hex, 16) {
            return Some(hex);
        }
    }
    // (1<<N) bit-shift forms.
    if let Some(shift_pos) = value.find("<<") {
        let digits: String = value[shift_pos + 2..]
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(char::is_ascii_digit)
            .collect();
        if let Ok(amount) = digits.parse::<u32>() {
            if amount < 63 {
                return Some(1i64 << amount);
            }
        }
    }
    // The compound directions are spelled as bitwise expressions in
    // Defines.dm; their values are fixed.
    match name {
        "NORTHEAST" => Some(5),
        "SOUTHEAST" => Some(6),
        "SOUTHWEST" => Some(10),
        "NORTHWEST" => Some(9),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn scans_decimal_and_hex() {
        let source = "#define TRUE 1\n#define FALSE 0\n#define MASK 0xFF\n";
        let constants = scan_defines(source);
        assert_eq!(
            constants,
            vec![
                ("TRUE".to_owned(), 1),
                ("FALSE".to_owned(), 0),
                ("MASK".to_owned(), 255)
            ]
        );
    }

    #[test]
    fn scans_shift_forms() {
        let source = "#define SEE_INFRA (1<<6)\n#define SEE_SELF (1<<5)\n";
        let constants = scan_defines(source);
        assert_eq!(
            constants,
            vec![("SEE_INFRA".to_owned(), 64), ("SEE_SELF".to_owned(), 32)]
        );
    }

    #[test]
    fn compound_directions_have_fixed_values() {
        let source = "#define NORTHEAST (NORTH|EAST)\n#define SOUTHWEST (SOUTH|WEST)\n";
        let constants = scan_defines(source);
        assert_eq!(
            constants,
            vec![("NORTHEAST".to_owned(), 5), ("SOUTHWEST".to_owned(), 10)]
        );
    }

    #[test]
    fn skips_non_numeric_defines() {
        let source = "#define VERSION_STRING \"1.0\"\n#define SQ(x) ((x)*(x))\n#define EMPTY\n";
        assert!(scan_defines(source).is_empty());
    }

    #[test]
    fn strips_trailing_comments() {
        let constants = scan_defines("#define NORTH 1 // up\n");
        assert_eq!(constants, vec![("NORTH".to_owned(), 1)]);
    }
}
