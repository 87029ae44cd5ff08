use std::collections::HashMap;

use crate::parser::Breakpoint;

/// Per-run index over the program's breakpoint table.
///
/// Each path's list is sorted by start line, then tightest range first, so a
/// lookup only needs to scan the breakpoints starting at or before the line.
#[derive(Debug, Clone, Default)]
pub struct BreakpointMap {
    by_path: HashMap<String, Vec<Breakpoint>>,
    by_id: HashMap<u32, Breakpoint>,
    max_id: u32,
}

fn span(bp: &Breakpoint) -> u32 {
    bp.end_line.saturating_sub(bp.line)
}

impl BreakpointMap {
    pub fn new(table: &[Breakpoint]) -> Self {
        let mut by_path: HashMap<String, Vec<Breakpoint>> = HashMap::new();
        let mut by_id = HashMap::new();
        let mut max_id = 0;
        for bp in table {
            by_path.entry(bp.path.clone()).or_default().push(bp.clone());
            by_id.insert(bp.id, bp.clone());
            max_id = max_id.max(bp.id);
        }
        for list in by_path.values_mut() {
            list.sort_by_key(|bp| (bp.line, span(bp), bp.column, bp.end_column));
        }
        Self {
            by_path,
            by_id,
            max_id,
        }
    }

    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        self.by_id.get(&id)
    }

    pub fn max_id(&self) -> u32 {
        self.max_id
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Tightest breakpoint whose `[line, endLine]` span contains `line`.
    ///
    /// Ties go to the smallest start column, then the narrowest column span.
    pub fn find(&self, path: &str, line: u32) -> Option<&Breakpoint> {
        let list = self.by_path.get(path)?;
        let upto = list.partition_point(|bp| bp.line <= line);
        list[..upto]
            .iter()
            .filter(|bp| bp.end_line >= line)
            .min_by_key(|bp| {
                (
                    span(bp),
                    bp.column,
                    bp.end_column.saturating_sub(bp.column),
                )
            })
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.by_path.keys().map(String::as_str)
    }

    pub fn for_path(&self, path: &str) -> &[Breakpoint] {
        self.by_path.get(path).map(Vec::as_slice).unwrap_or(&[])
    }
}
