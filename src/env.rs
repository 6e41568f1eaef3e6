use std::collections::HashMap;
use std::env as stdenv;
use std::path::PathBuf;

/// The shell's view of the process environment.
///
/// Only `HOME` (argument-less `cd`) and `PATH` (program lookup) are consumed,
/// but every variable is captured so lookups are consistent for the session.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Key-value store of environment variables.
    pub vars: HashMap<String, String>,
    /// Working directory as last set by `cd`.
    pub current_dir: PathBuf,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Capture the current process state into a new `Environment` instance.
    pub fn new() -> Self {
        let vars = stdenv::vars().collect();
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self { vars, current_dir }
    }

    /// Environment with only the given variables and the process working directory.
    pub fn with_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self { vars, current_dir }
    }

    pub fn get_var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn home(&self) -> Option<&str> {
        self.get_var("HOME")
    }

    pub fn search_path(&self) -> Option<&str> {
        self.get_var("PATH")
    }
}
