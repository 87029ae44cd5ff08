use std::collections::HashMap;

use super::types::LogicalLine;
use crate::error::ParseError;

pub fn label_name(line: &str) -> Option<&str> {
    let t = line.trim();
    t.strip_prefix(':')
        .map(|rest| rest.split_whitespace().next().unwrap_or(""))
}

/// Whether a function-body line produces an instruction.
pub fn is_instruction(line: &str) -> bool {
    let t = line.trim();
    !(t.starts_with(':') || t == "local" || t.starts_with("local "))
}

/// Scan labels (case-insensitive) and map them to the index of the next instruction.
pub fn build_label_map(body: &[LogicalLine]) -> Result<HashMap<String, usize>, ParseError> {
    let mut map = HashMap::new();
    let mut next_instr = 0usize;
    for line in body {
        if let Some(name) = label_name(&line.text) {
            if name.is_empty() {
                return Err(ParseError::new(line.phys_start + 1, "empty label"));
            }
            if map.insert(name.to_lowercase(), next_instr).is_some() {
                return Err(ParseError::new(
                    line.phys_start + 1,
                    format!("duplicate label `{name}`"),
                ));
            }
        } else if is_instruction(&line.text) {
            next_instr += 1;
        }
    }
    Ok(map)
}
