mod assembler;
mod commands;
mod labels;
mod preprocessor;
mod types;

pub use assembler::{load_program, parse_program};
pub use commands::{decode_instruction, split_tokens, DecodeContext};
pub use labels::build_label_map;
pub use preprocessor::preprocess_lines;
pub use types::{
    BinaryOp, Breakpoint, Function, Instr, Literal, LogicalLine, Program, RecordType,
};
