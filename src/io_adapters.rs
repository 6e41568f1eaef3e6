use crate::line_source::LineSource;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Result as IoResult, Write};
use std::rc::Rc;

/// Line source that replays a fixed script, then reports end of input.
///
/// Prompts passed to [`LineSource::read_line`] are recorded instead of printed.
pub struct ScriptedSource {
    lines: VecDeque<String>,
    prompts: Vec<String>,
}

impl ScriptedSource {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            prompts: Vec::new(),
        }
    }

    /// Prompts requested so far, one per line read.
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }
}

impl LineSource for ScriptedSource {
    fn read_line(&mut self, prompt: &str) -> anyhow::Result<Option<String>> {
        self.prompts.push(prompt.to_owned());
        Ok(self.lines.pop_front())
    }
}

/// Memory-backed writer for capturing the shell's interactive output.
#[derive(Default)]
pub struct MemWriter {
    buf: Rc<RefCell<Vec<u8>>>,
}

impl MemWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience: create writer and return (writer, rc_handle).
    pub fn with_handle() -> (Self, Rc<RefCell<Vec<u8>>>) {
        let mw = MemWriter::new();
        let rc = mw.buf.clone();
        (mw, rc)
    }
}

impl Write for MemWriter {
    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        self.buf.borrow_mut().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}
