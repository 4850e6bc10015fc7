//! Parsing of Makefile-style `.d` files, the format C compilers emit for
//! implicit dependencies: lines of `target: prereq prereq …` with backslash
//! continuations.

use std::collections::HashMap;

/// Parse depfile contents into `target -> prereqs`.
///
/// The format is forgiving: blank lines are skipped, a backslash-newline
/// continues the prerequisite list, and a target with no prerequisites is
/// allowed. Paths never contain spaces in this format.
pub fn parse(contents: &str) -> HashMap<String, Vec<String>> {
    let mut result = HashMap::new();

    // Logical lines: join physical lines ending in a backslash.
    let mut logical = String::new();
    let mut lines = Vec::new();
    for line in contents.lines() {
        if let Some(stripped) = line.strip_suffix('\\') {
            logical.push_str(stripped);
            logical.push(' ');
        } else {
            logical.push_str(line);
            lines.push(std::mem::take(&mut logical));
        }
    }
    if !logical.is_empty() {
        lines.push(logical);
    }

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((target, prereqs)) = line.split_once(':') else {
            continue;
        };
        let target = target.trim();
        if target.is_empty() {
            continue;
        }
        let deps = prereqs
            .split_whitespace()
            .map(|p| p.to_string())
            .collect::<Vec<_>>();
        result.insert(target.to_string(), deps);
    }

    result
}

/// All prerequisites in the file, regardless of target. The scan folds these
/// into a rule's input set without caring which output they were recorded
/// against.
pub fn all_prereqs(contents: &str) -> Vec<String> {
    let mut deps: Vec<String> = parse(contents).into_values().flatten().collect();
    deps.sort();
    deps.dedup();
    deps
}
