use anyhow::{Context, Result};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

/// Where command lines come from.
pub trait LineSource {
    /// Show `prompt` and block until a full line is available.
    ///
    /// `Ok(None)` means end of input.
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>>;
}

/// Terminal line editor. History is not recorded.
pub struct EditorSource {
    editor: DefaultEditor,
}

impl EditorSource {
    pub fn new() -> Result<Self> {
        let editor = DefaultEditor::new().context("failed to initialize line editor")?;
        Ok(Self { editor })
    }
}

impl LineSource for EditorSource {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        match self.editor.readline(prompt) {
            Ok(line) => Ok(Some(line)),
            // ^C at the prompt only discards the current line.
            Err(ReadlineError::Interrupted) => Ok(Some(String::new())),
            Err(ReadlineError::Eof) => Ok(None),
            Err(err) => Err(err).context("failed to read command line"),
        }
    }
}
