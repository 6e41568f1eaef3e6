//! Tokenization for the command line grammar.
//!
//! The grammar only knows space-separated words, so the lexer is a plain
//! iterator over an owned copy of the line. The parser pulls the program name
//! off the front and then works on [`Tokens::remainder`].

/// The two-character sequence replaced by the shell's process id.
pub const PID_VARIABLE: &str = "$$";

/// Iterator over the space-delimited words of an owned line.
///
/// Runs of spaces count as a single separator; other whitespace is part of a word.
#[derive(Debug, Clone)]
pub struct Tokens {
    line: String,
    pos: usize,
}

impl Tokens {
    pub fn new(line: impl Into<String>) -> Self {
        Tokens {
            line: line.into(),
            pos: 0,
        }
    }

    /// Text not yet consumed, with leading spaces removed.
    pub fn remainder(&self) -> &str {
        self.line[self.pos..].trim_start_matches(' ')
    }

    fn skip_spaces(&mut self) {
        let rest = &self.line[self.pos..];
        self.pos += rest.len() - rest.trim_start_matches(' ').len();
    }
}

impl Iterator for Tokens {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.skip_spaces();
        let rest = &self.line[self.pos..];
        if rest.is_empty() {
            return None;
        }
        let end = rest.find(' ').unwrap_or(rest.len());
        let word = rest[..end].to_owned();
        self.pos += end;
        Some(word)
    }
}

/// Replace every `$$` with `pid`, left to right, until none remain.
pub fn expand_pid(line: &str, pid: &str) -> String {
    let mut expanded = line.to_owned();
    while expanded.contains(PID_VARIABLE) {
        let next = expanded.replace(PID_VARIABLE, pid);
        if next == expanded {
            break;
        }
        expanded = next;
    }
    expanded
}
