use std::collections::HashMap;

use super::types::{BinaryOp, Instr, Literal};
use crate::error::ParseError;

/// Names visible while decoding one function body.
pub struct DecodeContext<'a> {
    pub locals: &'a [String],
    pub labels: &'a HashMap<String, usize>,
    pub functions: &'a HashMap<String, usize>,
}

/// Split a logical line into shell-style tokens; quotes group words.
pub fn split_tokens(line: &str, line_no: usize) -> Result<Vec<String>, ParseError> {
    shlex::split(line).ok_or_else(|| ParseError::new(line_no, "unbalanced quotes"))
}

fn operand<'t>(tokens: &'t [String], i: usize, line_no: usize) -> Result<&'t str, ParseError> {
    tokens.get(i).map(String::as_str).ok_or_else(|| {
        ParseError::new(line_no, format!("`{}` expects an operand", tokens[0]))
    })
}

fn number<T: std::str::FromStr>(tokens: &[String], i: usize, line_no: usize) -> Result<T, ParseError> {
    let raw = operand(tokens, i, line_no)?;
    raw.parse()
        .map_err(|_| ParseError::new(line_no, format!("bad number `{raw}`")))
}

fn background_flag(tokens: &[String], line_no: usize) -> Result<bool, ParseError> {
    match tokens.get(3).map(String::as_str) {
        None => Ok(false),
        Some("bg") => Ok(true),
        Some(other) => Err(ParseError::new(line_no, format!("expected `bg`, got `{other}`"))),
    }
}

impl DecodeContext<'_> {
    fn slot(&self, name: &str, line_no: usize) -> Result<usize, ParseError> {
        self.locals
            .iter()
            .position(|l| l == name)
            .ok_or_else(|| ParseError::new(line_no, format!("unknown local `{name}`")))
    }

    fn label(&self, name: &str, line_no: usize) -> Result<usize, ParseError> {
        let key = name.trim_start_matches(':').to_lowercase();
        self.labels
            .get(&key)
            .copied()
            .ok_or_else(|| ParseError::new(line_no, format!("unknown label `{name}`")))
    }

    fn function(&self, name: &str, line_no: usize) -> Result<usize, ParseError> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| ParseError::new(line_no, format!("unknown function `{name}`")))
    }
}

/// Decode one instruction line.
pub fn decode_instruction(
    line: &str,
    line_no: usize,
    ctx: &DecodeContext<'_>,
) -> Result<Instr, ParseError> {
    let tokens = split_tokens(line, line_no)?;
    let Some(mnemonic) = tokens.first() else {
        return Err(ParseError::new(line_no, "empty instruction"));
    };

    let instr = match mnemonic.to_lowercase().as_str() {
        "num" => Instr::Push {
            value: Literal::Num(number(&tokens, 1, line_no)?),
        },
        "str" => Instr::Push {
            value: Literal::Str(tokens[1..].join(" ")),
        },
        "bool" => Instr::Push {
            value: Literal::Bool(number::<bool>(&tokens, 1, line_no)?),
        },
        "null" => Instr::Push {
            value: Literal::Null,
        },
        "load" => Instr::Load {
            slot: ctx.slot(operand(&tokens, 1, line_no)?, line_no)?,
        },
        "store" => Instr::Store {
            slot: ctx.slot(operand(&tokens, 1, line_no)?, line_no)?,
        },
        "getg" => Instr::LoadGlobal {
            name: operand(&tokens, 1, line_no)?.to_string(),
        },
        "setg" => Instr::StoreGlobal {
            name: operand(&tokens, 1, line_no)?.to_string(),
        },
        "loadcap" => Instr::LoadCapture {
            index: number(&tokens, 1, line_no)?,
        },
        "closure" => Instr::MakeClosure {
            function: ctx.function(operand(&tokens, 1, line_no)?, line_no)?,
            captures: number(&tokens, 2, line_no)?,
        },
        "call" => Instr::Call {
            function: ctx.function(operand(&tokens, 1, line_no)?, line_no)?,
            argc: number(&tokens, 2, line_no)?,
        },
        "calli" => Instr::CallIndirect {
            argc: number(&tokens, 1, line_no)?,
        },
        "ret" => Instr::Return,
        "jmp" => Instr::Jump {
            target: ctx.label(operand(&tokens, 1, line_no)?, line_no)?,
        },
        "jz" => Instr::JumpIfFalse {
            target: ctx.label(operand(&tokens, 1, line_no)?, line_no)?,
        },
        "add" => Instr::Binary { op: BinaryOp::Add },
        "sub" => Instr::Binary { op: BinaryOp::Sub },
        "mul" => Instr::Binary { op: BinaryOp::Mul },
        "lt" => Instr::Binary { op: BinaryOp::Lt },
        "eq" => Instr::Binary { op: BinaryOp::Eq },
        "not" => Instr::Not,
        "pop" => Instr::Pop,
        "dup" => Instr::Dup,
        "try" => Instr::BeginTry {
            handler: ctx.label(operand(&tokens, 1, line_no)?, line_no)?,
        },
        "endtry" => Instr::EndTry,
        "catch" => Instr::Catch,
        "throw" => Instr::Throw,
        "endfinally" => Instr::EndFinally,
        "bp" => Instr::Breakpoint {
            id: number(&tokens, 1, line_no)?,
        },
        "new" => Instr::NewRecord {
            type_name: operand(&tokens, 1, line_no)?.to_string(),
        },
        "setf" => Instr::SetField {
            name: operand(&tokens, 1, line_no)?.to_string(),
        },
        "getf" => Instr::GetField {
            name: operand(&tokens, 1, line_no)?.to_string(),
        },
        "array" => Instr::NewArray,
        "apush" => Instr::ArrayPush,
        "index" => Instr::Index,
        "map" => Instr::NewMap,
        "buffer" => Instr::NewBuffer {
            size: number(&tokens, 1, line_no)?,
        },
        "sleep" => Instr::Sleep,
        "listen" => Instr::Listen {
            source: number(&tokens, 1, line_no)?,
            event: number(&tokens, 2, line_no)?,
            background: background_flag(&tokens, line_no)?,
        },
        "unlisten" => Instr::Unlisten {
            source: number(&tokens, 1, line_no)?,
            event: number(&tokens, 2, line_no)?,
            background: background_flag(&tokens, line_no)?,
        },
        "raise" => Instr::Raise {
            source: number(&tokens, 1, line_no)?,
            event: number(&tokens, 2, line_no)?,
        },
        "wait" => Instr::WaitEvent {
            source: number(&tokens, 1, line_no)?,
            event: number(&tokens, 2, line_no)?,
        },
        "fork" => Instr::Fork {
            argc: number(&tokens, 1, line_no)?,
        },
        "print" => Instr::Print,
        other => {
            return Err(ParseError::new(
                line_no,
                format!("unknown instruction `{other}`"),
            ))
        }
    };
    Ok(instr)
}
