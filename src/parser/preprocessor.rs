use super::types::LogicalLine;

/// Strip a trailing `#` comment, ignoring `#` inside double quotes.
pub fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Join physical lines continued with a trailing `\` and drop blank/comment-only lines.
pub fn preprocess_lines(physical: &[&str]) -> Vec<LogicalLine> {
    let mut out = Vec::new();
    let mut i = 0usize;

    while i < physical.len() {
        let start = i;
        let mut buf = String::new();

        loop {
            let text = strip_comment(physical[i]).trim_end();
            let (continues, head) = match text.strip_suffix('\\') {
                Some(head) if !head.ends_with('\\') => (true, head),
                _ => (false, text),
            };

            if !buf.is_empty() {
                buf.push(' ');
            }
            buf.push_str(head.trim());

            if continues && i + 1 < physical.len() {
                i += 1;
                continue;
            }
            break;
        }

        if !buf.trim().is_empty() {
            out.push(LogicalLine {
                text: buf,
                phys_start: start,
                phys_end: i,
            });
        }
        i += 1;
    }

    out
}
