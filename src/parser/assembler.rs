use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use super::commands::{decode_instruction, split_tokens, DecodeContext};
use super::labels::{build_label_map, is_instruction, label_name};
use super::preprocessor::preprocess_lines;
use super::types::{Breakpoint, Function, Instr, LogicalLine, Program, RecordType};
use crate::error::{LoadError, ParseError};

fn line_no(line: &LogicalLine) -> usize {
    line.phys_start + 1
}

fn parse_u32(token: Option<&String>, what: &str, line: usize) -> Result<u32, ParseError> {
    let raw = token.ok_or_else(|| ParseError::new(line, format!("missing {what}")))?;
    raw.parse()
        .map_err(|_| ParseError::new(line, format!("bad {what} `{raw}`")))
}

/// Collect function names first so calls may refer to functions defined later.
fn function_names(lines: &[LogicalLine]) -> Result<HashMap<String, usize>, ParseError> {
    let mut names = HashMap::new();
    for line in lines {
        let tokens = split_tokens(&line.text, line_no(line))?;
        if tokens.first().map(String::as_str) == Some("function") {
            let name = tokens
                .get(1)
                .ok_or_else(|| ParseError::new(line_no(line), "function needs a name"))?;
            let index = names.len();
            if names.insert(name.clone(), index).is_some() {
                return Err(ParseError::new(
                    line_no(line),
                    format!("duplicate function `{name}`"),
                ));
            }
        }
    }
    Ok(names)
}

fn assemble_function(
    header: &[String],
    body: &[LogicalLine],
    functions: &HashMap<String, usize>,
) -> Result<Function, ParseError> {
    let name = header[1].clone();
    let mut locals: Vec<String> = header[2..].to_vec();
    let params = locals.len();

    for line in body {
        let tokens = split_tokens(&line.text, line_no(line))?;
        if tokens.first().map(String::as_str) == Some("local") {
            for local in &tokens[1..] {
                if locals.contains(local) {
                    return Err(ParseError::new(
                        line_no(line),
                        format!("local `{local}` declared twice"),
                    ));
                }
                locals.push(local.clone());
            }
        }
    }

    let labels = build_label_map(body)?;
    let ctx = DecodeContext {
        locals: &locals,
        labels: &labels,
        functions,
    };

    let mut code = Vec::new();
    let mut lines = Vec::new();
    for line in body {
        if label_name(&line.text).is_some() || !is_instruction(&line.text) {
            continue;
        }
        code.push(decode_instruction(&line.text, line_no(line), &ctx)?);
        lines.push(line_no(line));
    }

    Ok(Function {
        name,
        params,
        locals,
        code,
        lines,
    })
}

/// Load a program from disk: `.json` files are deserialized, anything else is assembled.
pub fn load_program(path: &Path) -> Result<Program, LoadError> {
    let text = fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        let program = Program::from_json(&text)?;
        validate(&program)?;
        Ok(program)
    } else {
        Ok(parse_program(&text)?)
    }
}

/// Assemble program text into a [`Program`].
pub fn parse_program(source: &str) -> Result<Program, ParseError> {
    let physical: Vec<&str> = source.lines().collect();
    let logical = preprocess_lines(&physical);
    let functions = function_names(&logical)?;

    let mut program = Program::default();
    let mut i = 0usize;
    while i < logical.len() {
        let line = &logical[i];
        let n = line_no(line);
        let tokens = split_tokens(&line.text, n)?;
        match tokens[0].as_str() {
            "global" => {
                if tokens.len() < 2 {
                    return Err(ParseError::new(n, "global needs a name"));
                }
                program.globals.extend(tokens[1..].iter().cloned());
            }
            "record" => {
                let name = tokens
                    .get(1)
                    .ok_or_else(|| ParseError::new(n, "record needs a type name"))?;
                let expected_instances = match tokens.get(2) {
                    Some(_) => parse_u32(tokens.get(2), "instance count", n)? as usize,
                    None => 0,
                };
                program.records.push(RecordType {
                    name: name.clone(),
                    expected_instances,
                });
            }
            "breakpoint" => {
                let id = parse_u32(tokens.get(1), "breakpoint id", n)?;
                let path = tokens
                    .get(2)
                    .ok_or_else(|| ParseError::new(n, "breakpoint needs a path"))?
                    .clone();
                let bp = Breakpoint {
                    id,
                    path,
                    line: parse_u32(tokens.get(3), "line", n)?,
                    column: parse_u32(tokens.get(4), "column", n)?,
                    end_line: parse_u32(tokens.get(5), "end line", n)?,
                    end_column: parse_u32(tokens.get(6), "end column", n)?,
                };
                if bp.end_line < bp.line {
                    return Err(ParseError::new(n, "breakpoint ends before it starts"));
                }
                if program.breakpoint(id).is_some() {
                    return Err(ParseError::new(n, format!("duplicate breakpoint {id}")));
                }
                program.breakpoints.push(bp);
            }
            "function" => {
                let end = logical[i + 1..]
                    .iter()
                    .position(|l| l.text.trim() == "end")
                    .map(|offset| i + 1 + offset)
                    .ok_or_else(|| ParseError::new(n, "function without `end`"))?;
                let body = &logical[i + 1..end];
                if let Some(nested) = body
                    .iter()
                    .find(|l| l.text.trim_start().starts_with("function "))
                {
                    return Err(ParseError::new(line_no(nested), "nested function"));
                }
                program
                    .functions
                    .push(assemble_function(&tokens, body, &functions)?);
                i = end;
            }
            other => {
                return Err(ParseError::new(
                    n,
                    format!("`{other}` outside of a function"),
                ))
            }
        }
        i += 1;
    }

    validate(&program)?;
    Ok(program)
}

/// Checks shared by assembled and deserialized programs.
fn validate(program: &Program) -> Result<(), ParseError> {
    let mut ids = HashSet::new();
    for bp in &program.breakpoints {
        if bp.end_line < bp.line {
            return Err(ParseError::new(
                bp.line as usize,
                format!("breakpoint {} ends before it starts", bp.id),
            ));
        }
        if !ids.insert(bp.id) {
            return Err(ParseError::new(
                bp.line as usize,
                format!("duplicate breakpoint {}", bp.id),
            ));
        }
    }

    let count = program.functions.len();
    for function in &program.functions {
        let len = function.code.len();
        for (pc, instr) in function.code.iter().enumerate() {
            let bad = match instr {
                Instr::Call { function: f, .. } | Instr::MakeClosure { function: f, .. }
                    if *f >= count =>
                {
                    Some(format!("call to unknown function #{f}"))
                }
                Instr::Jump { target }
                | Instr::JumpIfFalse { target }
                | Instr::BeginTry { handler: target }
                    if *target > len =>
                {
                    Some(format!("jump target {target} past the end of `{}`", function.name))
                }
                Instr::Breakpoint { id } if program.breakpoint(*id).is_none() => {
                    Some(format!("undeclared breakpoint {id}"))
                }
                Instr::NewRecord { type_name } if program.record(type_name).is_none() => {
                    Some(format!("undeclared record type `{type_name}`"))
                }
                Instr::LoadGlobal { name } | Instr::StoreGlobal { name }
                    if !program.globals.contains(name) =>
                {
                    Some(format!("undeclared global `{name}`"))
                }
                _ => None,
            };
            if let Some(message) = bad {
                return Err(ParseError::new(function.line_of(pc), message));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::types::Literal;

    const SAMPLE: &str = r#"
global counter
record Sprite 2
breakpoint 1 main.ts 3 0 3 10

function main
  local s
  bp 1
  num 2
  num 3
  call add 2
  setg counter
  new Sprite
  store s
  ret
end

function add a b
  load a
  load b
  add
  ret
end
"#;

    #[test]
    fn assembles_sample() {
        let program = parse_program(SAMPLE).unwrap();
        assert_eq!(program.globals, vec!["counter"]);
        assert_eq!(program.records[0].expected_instances, 2);
        assert_eq!(program.breakpoints[0].path, "main.ts");

        let main = &program.functions[0];
        assert_eq!(main.locals, vec!["s"]);
        assert_eq!(main.code[0], Instr::Breakpoint { id: 1 });
        assert_eq!(
            main.code[1],
            Instr::Push {
                value: Literal::Num(2.0)
            }
        );
        assert_eq!(main.code[3], Instr::Call { function: 1, argc: 2 });
        assert_eq!(main.line_of(0), 8);

        let add = &program.functions[1];
        assert_eq!(add.params, 2);
        assert_eq!(add.code.len(), 4);
    }

    #[test]
    fn rejects_undeclared_breakpoint() {
        let err = parse_program("function main\n bp 9\nend\n").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn rejects_missing_end() {
        assert!(parse_program("function main\n ret\n").is_err());
    }

    #[test]
    fn rejects_inverted_breakpoint_in_json() {
        let mut program = parse_program(SAMPLE).unwrap();
        program.breakpoints[0].end_line = 1;
        let err = validate(&program).unwrap_err();
        assert!(err.message.contains("ends before it starts"));
    }

    #[test]
    fn json_round_trip_matches_text() {
        let program = parse_program(SAMPLE).unwrap();
        let json = serde_json::to_string(&program).unwrap();
        assert!(json.contains(r#"{"instr":"binary","op":"add"}"#));
        assert_eq!(Program::from_json(&json).unwrap(), program);
    }
}
