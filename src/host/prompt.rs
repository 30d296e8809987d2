//! Operator decisions, separated from the mutations they gate.
//!
//! Steps ask a `Prompter` and never read the terminal themselves. Each
//! question carries a stable key so unattended runs can answer it from a
//! JSON answers file.
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::Path;

pub trait Prompter: Send + Sync {
    fn confirm(&self, key: &str, question: &str, default: bool) -> Result<bool>;

    fn input(&self, key: &str, question: &str, default: Option<&str>) -> Result<String>;

    /// Like `input`, without echo.
    fn secret(&self, key: &str, question: &str) -> Result<String>;

    /// Show instructions the operator must follow outside vmprep.
    fn notice(&self, text: &str);

    /// Whether a rejected answer can be asked again.
    fn interactive(&self) -> bool;
}

/// Ask repeatedly until `parse` accepts the answer, or fail when nobody can retype it.
pub fn ask_parsed<T>(
    prompter: &dyn Prompter,
    key: &str,
    question: &str,
    default: Option<&str>,
    parse: impl Fn(&str) -> Result<T>,
) -> Result<T> {
    loop {
        let answer = prompter.input(key, question, default)?;
        match parse(answer.trim()) {
            Ok(value) => return Ok(value),
            Err(err) if prompter.interactive() => {
                prompter.notice(&format!("invalid answer: {err:#}"));
            }
            Err(err) => return Err(err.context(format!("answer for `{key}`"))),
        }
    }
}

/// Reads answers from the controlling terminal; questions go to stderr.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    fn read_line(&self, question: &str) -> Result<String> {
        let mut stderr = io::stderr().lock();
        write!(stderr, "{question} ").context("write prompt")?;
        stderr.flush().context("flush prompt")?;
        let mut line = String::new();
        let read = io::stdin()
            .lock()
            .read_line(&mut line)
            .context("read answer from stdin")?;
        if read == 0 {
            return Err(anyhow!("stdin closed while waiting for an answer to: {question}"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

impl Prompter for TerminalPrompter {
    fn confirm(&self, _key: &str, question: &str, default: bool) -> Result<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        loop {
            let answer = self.read_line(&format!("{question} {hint}"))?;
            match answer.trim().to_ascii_lowercase().as_str() {
                "" => return Ok(default),
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => self.notice("please answer y or n"),
            }
        }
    }

    fn input(&self, _key: &str, question: &str, default: Option<&str>) -> Result<String> {
        let prompt = match default {
            Some(default) => format!("{question} [{default}]:"),
            None => format!("{question}:"),
        };
        loop {
            let answer = self.read_line(&prompt)?;
            let answer = answer.trim();
            match (answer.is_empty(), default) {
                (false, _) => return Ok(answer.to_string()),
                (true, Some(default)) => return Ok(default.to_string()),
                (true, None) => self.notice("a value is required"),
            }
        }
    }

    fn secret(&self, _key: &str, question: &str) -> Result<String> {
        let _echo = EchoGuard::disable();
        let answer = self.read_line(&format!("{question}:"));
        eprintln!();
        answer
    }

    fn notice(&self, text: &str) {
        eprintln!("{text}");
    }

    fn interactive(&self) -> bool {
        true
    }
}

/// Turns terminal echo off for the guard's lifetime; a no-op when stdin is not a tty.
struct EchoGuard {
    saved: Option<libc::termios>,
}

impl EchoGuard {
    fn disable() -> Self {
        if !io::stdin().is_terminal() {
            return Self { saved: None };
        }
        // SAFETY: tcgetattr/tcsetattr only read and write the termios struct we own.
        unsafe {
            let mut term: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut term) != 0 {
                return Self { saved: None };
            }
            let saved = term;
            term.c_lflag &= !libc::ECHO;
            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &term) != 0 {
                return Self { saved: None };
            }
            Self { saved: Some(saved) }
        }
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved {
            // SAFETY: restores the attributes captured in `disable`.
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &saved);
            }
        }
    }
}

/// Answers from a key/value map; confirmations default to yes.
#[derive(Debug, Default)]
pub struct UnattendedPrompter {
    answers: BTreeMap<String, Value>,
}

impl UnattendedPrompter {
    pub fn new(answers: BTreeMap<String, Value>) -> Self {
        Self { answers }
    }

    /// Load a flat JSON object of answers.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("read answers {}", path.display()))?;
        let answers: BTreeMap<String, Value> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse answers {} as a JSON object", path.display()))?;
        Ok(Self { answers })
    }

    fn text(&self, key: &str) -> Result<Option<String>> {
        match self.answers.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(Value::Number(number)) => Ok(Some(number.to_string())),
            Some(Value::Bool(flag)) => Ok(Some(flag.to_string())),
            Some(other) => Err(anyhow!("answer for `{key}` must be a string, got {other}")),
        }
    }
}

impl Prompter for UnattendedPrompter {
    fn confirm(&self, key: &str, question: &str, _default: bool) -> Result<bool> {
        let answer = match self.answers.get(key) {
            None | Some(Value::Null) => true,
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(text)) => matches!(text.to_ascii_lowercase().as_str(), "y" | "yes"),
            Some(other) => {
                return Err(anyhow!("answer for `{key}` must be a boolean, got {other}"));
            }
        };
        tracing::info!(key, answer, question, "unattended confirmation");
        Ok(answer)
    }

    fn input(&self, key: &str, question: &str, default: Option<&str>) -> Result<String> {
        let answer = self
            .text(key)?
            .or_else(|| default.map(str::to_string))
            .ok_or_else(|| {
                anyhow!("no answer for `{key}` ({question}); add it to the answers file")
            })?;
        tracing::info!(key, answer = %answer, "unattended answer");
        Ok(answer)
    }

    fn secret(&self, key: &str, question: &str) -> Result<String> {
        let answer = self.text(key)?.ok_or_else(|| {
            anyhow!("no answer for `{key}` ({question}); add it to the answers file")
        })?;
        tracing::info!(key, "unattended secret supplied");
        Ok(answer)
    }

    fn notice(&self, text: &str) {
        tracing::info!("{text}");
    }

    fn interactive(&self) -> bool {
        false
    }
}
