//! Operator dialogs.
//!
//! The proxy asks the operator three kinds of questions: acknowledge an error,
//! retry or give up on the chat server, and pick a game when none is set.
//! [`TerminalPrompt`] answers them from stdin. Stdin is read by one task for
//! the whole process; a line goes to the pending question if there is one,
//! otherwise back to the caller as a console command.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::launcher::LaunchGame;

pub trait Prompt: Send + Sync + 'static {
    /// Shows an error the operator has to see.
    fn alert(&self, message: &str) -> impl Future<Output = ()> + Send;

    /// Returns true to retry, false to cancel.
    fn retry_or_cancel(&self, message: &str) -> impl Future<Output = bool> + Send;

    /// `None` when the operator made no choice.
    fn choose_game(&self) -> impl Future<Output = Option<LaunchGame>> + Send;
}

#[derive(Default)]
pub struct TerminalPrompt {
    pending: Mutex<Option<oneshot::Sender<String>>>,
    closed: AtomicBool,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gives `line` to the question being asked. Returns it back when nothing
    /// is being asked.
    pub fn offer(&self, line: String) -> Option<String> {
        let pending = match self.pending.lock() {
            Ok(mut pending) => pending.take(),
            Err(_) => None,
        };
        match pending {
            Some(tx) => match tx.send(line) {
                Ok(()) => None,
                Err(line) => Some(line),
            },
            None => Some(line),
        }
    }

    /// Stdin is gone: every question from now on gets no answer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }
    }

    async fn ask(&self, question: &str) -> Option<String> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(tx);
        }
        eprint!("{question} ");
        rx.await.ok().map(|answer| answer.trim().to_lowercase())
    }
}

impl Prompt for TerminalPrompt {
    async fn alert(&self, message: &str) {
        eprintln!("\n{message}\n");
    }

    async fn retry_or_cancel(&self, message: &str) -> bool {
        eprintln!("\n{message}");
        loop {
            match self.ask("[r]etry or [c]ancel?").await.as_deref() {
                Some("r" | "retry") => return true,
                Some("c" | "cancel") | None => return false,
                Some(other) => debug!(answer = other, "Unrecognized answer"),
            }
        }
    }

    async fn choose_game(&self) -> Option<LaunchGame> {
        eprintln!("\nWhich game should be launched?");
        for (i, game) in LaunchGame::CHOICES.iter().enumerate() {
            eprintln!("  {}) {}", i + 1, game.title());
        }
        let answer = self.ask("Enter a number (empty to cancel):").await?;
        let picked = answer
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| LaunchGame::CHOICES.get(i).copied());
        if picked.is_none() && !answer.is_empty() {
            warn!(answer = %answer, "Invalid game choice");
        }
        picked
    }
}

/// Reads stdin line by line until EOF.
pub fn spawn_stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
        debug!("Stdin closed");
    });
    rx
}

#[cfg(test)]
pub mod testing {
    //! Scripted answers for tests.

    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub struct ScriptedPrompt {
        pub retries: Mutex<VecDeque<bool>>,
        pub game: Option<LaunchGame>,
        pub alerts: Mutex<Vec<String>>,
        pub asked: Mutex<Vec<String>>,
    }

    impl ScriptedPrompt {
        pub fn with_retries(answers: &[bool]) -> Self {
            Self {
                retries: Mutex::new(answers.iter().copied().collect()),
                ..Self::default()
            }
        }

        pub fn questions_asked(&self) -> usize {
            self.asked.lock().unwrap().len()
        }
    }

    impl Prompt for ScriptedPrompt {
        async fn alert(&self, message: &str) {
            self.alerts.lock().unwrap().push(message.to_string());
        }

        async fn retry_or_cancel(&self, message: &str) -> bool {
            self.asked.lock().unwrap().push(message.to_string());
            self.retries.lock().unwrap().pop_front().unwrap_or(false)
        }

        async fn choose_game(&self) -> Option<LaunchGame> {
            self.game
        }
    }
}
