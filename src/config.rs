/// Prompt printed before every command line.
pub const DEFAULT_PROMPT: &str = ": ";

/// Most background jobs tracked at once.
pub const JOB_CAPACITY: usize = 200;

/// Longest accepted input line in bytes; longer lines are truncated.
pub const MAX_LINE_LEN: usize = 2048;

/// Most arguments kept for a single command.
pub const MAX_ARGS: usize = 512;

/// Tunables of an [`Interpreter`](crate::Interpreter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    pub prompt: String,
    pub job_capacity: usize,
    pub max_line_len: usize,
    pub max_args: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            prompt: DEFAULT_PROMPT.to_owned(),
            job_capacity: JOB_CAPACITY,
            max_line_len: MAX_LINE_LEN,
            max_args: MAX_ARGS,
        }
    }
}

impl ShellConfig {
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}
