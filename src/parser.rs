use crate::command::{Command, Parsed};
use crate::config::{MAX_ARGS, MAX_LINE_LEN};
use crate::lexer::{Tokens, expand_pid};
use crate::mode::Mode;
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

/// Standalone trailing token that requests background execution.
const BACKGROUND_MARKER: &str = "&";

/// Marks the whole line as a comment when it comes first.
const COMMENT_MARKER: char = '#';

/// `< file`: everything after the operator up to the next space.
static INPUT_REDIRECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"< ([^ ]*)").expect("valid input redirect pattern"));

/// `> file`: everything after the operator up to the next space.
static OUTPUT_REDIRECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"> ([^ ]*)").expect("valid output redirect pattern"));

/// Turns raw input lines into [`Parsed`] values.
///
/// Parsing never fails. Garbled redirections degrade to absent files and
/// overlong input is cut to the configured limits.
#[derive(Debug, Clone)]
pub struct LineParser {
    shell_pid: String,
    max_line_len: usize,
    max_args: usize,
}

impl LineParser {
    pub fn new(shell_pid: u32) -> Self {
        LineParser {
            shell_pid: shell_pid.to_string(),
            max_line_len: MAX_LINE_LEN,
            max_args: MAX_ARGS,
        }
    }

    pub fn with_limits(mut self, max_line_len: usize, max_args: usize) -> Self {
        self.max_line_len = max_line_len;
        self.max_args = max_args;
        self
    }

    /// Parse one line. `mode` decides whether a trailing `&` is honored.
    pub fn parse(&self, line: &str, mode: Mode) -> Parsed {
        let line = line.trim_end_matches(['\n', '\r']);
        let line = truncate_at_char_boundary(line, self.max_line_len);

        let content = line.trim_start_matches(' ');
        if content.is_empty() || content.starts_with(COMMENT_MARKER) {
            return Parsed::Empty;
        }

        let mut tokens = Tokens::new(expand_pid(line, &self.shell_pid));
        let Some(program) = tokens.next() else {
            return Parsed::Empty;
        };

        let mut rest: Vec<String> = Tokens::new(tokens.remainder()).collect();
        let marked = rest.last().is_some_and(|last| last == BACKGROUND_MARKER);
        if marked {
            rest.pop();
        }

        // Trailing space lets an operator at the very end match as an empty clause.
        let mut text = rest.join(" ");
        text.push(' ');
        let input_file = take_redirect(&INPUT_REDIRECT, &mut text);
        let output_file = take_redirect(&OUTPUT_REDIRECT, &mut text);

        let mut arguments: Vec<String> = Tokens::new(text).collect();
        if arguments.len() > self.max_args {
            warn!(
                count = arguments.len(),
                limit = self.max_args,
                "too many arguments, extra ones dropped"
            );
            arguments.truncate(self.max_args);
        }

        Parsed::Command(Command {
            program,
            arguments,
            input_file,
            output_file,
            background: marked && mode.allows_background(),
        })
    }
}

/// Parse `line` with the default limits.
pub fn parse_line(line: &str, shell_pid: u32, mode: Mode) -> Parsed {
    LineParser::new(shell_pid).parse(line, mode)
}

/// Remove the first clause matching `pattern` from `text` and return its file.
fn take_redirect(pattern: &Regex, text: &mut String) -> Option<String> {
    let captures = pattern.captures(text)?;
    let clause = captures.get(0)?.range();
    let file = captures
        .get(1)
        .map(|m| m.as_str().to_owned())
        .filter(|file| !file.is_empty());
    text.replace_range(clause, " ");
    file
}

fn truncate_at_char_boundary(line: &str, max_len: usize) -> &str {
    if line.len() <= max_len {
        return line;
    }
    let mut end = max_len;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    warn!(len = line.len(), limit = max_len, "input line too long, truncated");
    &line[..end]
}
