//! Interactive confirmation gate.

use std::io::{self, BufRead, IsTerminal, Write};
use tracing::warn;

pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Asks on stderr and reads a line from stdin. Declines when stdin is not a terminal.
pub struct TerminalPrompt;

impl Confirm for TerminalPrompt {
    fn confirm(&self, prompt: &str) -> bool {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            warn!("{} (no terminal; pass --yes to proceed non-interactively)", prompt);
            return false;
        }

        eprint!("{} [y/N] ", prompt);
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if stdin.lock().read_line(&mut answer).is_err() {
            return false;
        }
        is_yes(&answer)
    }
}

/// `--yes`: every prompt is accepted.
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
