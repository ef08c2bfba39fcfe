//! Human-in-the-loop question surface.
//!
//! Handlers ask a question and block until an answer arrives or the run is
//! cancelled. The `QuestionBridge` variant is the integration point for a
//! control plane: it registers a pending question and a one-shot answer
//! channel in the same critical section, so a question only becomes visible
//! to clients once it can be answered.

use crate::WaymarkError;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub id: String,
    pub node_id: String,
    pub text: String,
    pub options: Vec<String>,
}

#[async_trait]
pub trait Interviewer: Send + Sync {
    async fn ask(
        &self,
        cancel: &CancellationToken,
        question: Question,
    ) -> Result<String, WaymarkError>;
}

/// No interviewer configured: every question is an error.
#[derive(Debug, Default)]
pub struct NullInterviewer;

#[async_trait]
impl Interviewer for NullInterviewer {
    async fn ask(
        &self,
        _cancel: &CancellationToken,
        question: Question,
    ) -> Result<String, WaymarkError> {
        Err(WaymarkError::Runtime(format!(
            "no interviewer configured to answer question at node '{}'",
            question.node_id
        )))
    }
}

/// Picks the first option, or answers "yes" to free-form questions. Used for
/// unattended runs and tests.
#[derive(Debug, Default)]
pub struct AutoInterviewer;

#[async_trait]
impl Interviewer for AutoInterviewer {
    async fn ask(
        &self,
        _cancel: &CancellationToken,
        question: Question,
    ) -> Result<String, WaymarkError> {
        Ok(question
            .options
            .first()
            .cloned()
            .unwrap_or_else(|| "yes".to_string()))
    }
}

/// Prints the question and reads one line from stdin.
#[derive(Debug, Default)]
pub struct ConsoleInterviewer;

#[async_trait]
impl Interviewer for ConsoleInterviewer {
    async fn ask(
        &self,
        cancel: &CancellationToken,
        question: Question,
    ) -> Result<String, WaymarkError> {
        let blocking = tokio::task::spawn_blocking(move || ask_console(&question));
        tokio::select! {
            answer = blocking => answer
                .map_err(|_| WaymarkError::Runtime("console interviewer task failed".to_string()))?
                .ok_or_else(|| WaymarkError::Runtime("stdin closed while waiting for answer".to_string())),
            _ = cancel.cancelled() => Err(WaymarkError::Canceled(
                "cancelled while waiting for console answer".to_string(),
            )),
        }
    }
}

fn ask_console(question: &Question) -> Option<String> {
    eprintln!("[?] {}", question.text);
    for (index, option) in question.options.iter().enumerate() {
        eprintln!("  [{}] {}", index + 1, option);
    }
    let raw = read_line("> ")?;
    if let Ok(index) = raw.parse::<usize>() {
        if index >= 1 && index <= question.options.len() {
            return Some(question.options[index - 1].clone());
        }
    }
    Some(raw)
}

fn read_line(prompt: &str) -> Option<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{prompt}").ok()?;
    stdout.flush().ok()?;

    let mut raw = String::new();
    io::stdin().read_line(&mut raw).ok()?;
    Some(raw.trim().to_string())
}

/// Scripted answers for tests; runs out of answers with an error.
#[derive(Default)]
pub struct QueueInterviewer {
    answers: Mutex<VecDeque<String>>,
}

impl QueueInterviewer {
    pub fn with_answers<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
        }
    }

    pub fn push_answer(&self, answer: impl Into<String>) {
        if let Ok(mut answers) = self.answers.lock() {
            answers.push_back(answer.into());
        }
    }
}

#[async_trait]
impl Interviewer for QueueInterviewer {
    async fn ask(
        &self,
        _cancel: &CancellationToken,
        question: Question,
    ) -> Result<String, WaymarkError> {
        self.answers
            .lock()
            .ok()
            .and_then(|mut answers| answers.pop_front())
            .ok_or_else(|| {
                WaymarkError::Runtime(format!(
                    "queue interviewer has no answer for question at node '{}'",
                    question.node_id
                ))
            })
    }
}

struct PendingEntry {
    question: Question,
    reply: oneshot::Sender<String>,
}

/// Pending-question registry with one-shot answer channels. A control plane
/// lists `pending_questions()` and resolves them by id via `answer()`.
#[derive(Clone, Default)]
pub struct QuestionBridge {
    pending: Arc<Mutex<BTreeMap<String, PendingEntry>>>,
    counter: Arc<Mutex<u64>>,
}

impl QuestionBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_questions(&self) -> Vec<Question> {
        self.pending
            .lock()
            .map(|pending| {
                pending
                    .values()
                    .map(|entry| entry.question.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve a pending question. Unknown ids and already-answered
    /// questions report an error.
    pub fn answer(&self, question_id: &str, answer: impl Into<String>) -> Result<(), WaymarkError> {
        let entry = {
            let mut pending = self.pending.lock().map_err(|_| {
                WaymarkError::Runtime("question bridge lock poisoned".to_string())
            })?;
            pending.remove(question_id)
        }
        .ok_or_else(|| {
            WaymarkError::Runtime(format!("no pending question with id '{question_id}'"))
        })?;

        entry
            .reply
            .send(answer.into())
            .map_err(|_| WaymarkError::Runtime("question was abandoned by the run".to_string()))
    }

    fn next_id(&self, node_id: &str) -> String {
        let mut counter = self
            .counter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counter += 1;
        format!("{node_id}-q{}", *counter)
    }
}

#[async_trait]
impl Interviewer for QuestionBridge {
    async fn ask(
        &self,
        cancel: &CancellationToken,
        mut question: Question,
    ) -> Result<String, WaymarkError> {
        if question.id.is_empty() {
            question.id = self.next_id(&question.node_id);
        }
        let question_id = question.id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().map_err(|_| {
                WaymarkError::Runtime("question bridge lock poisoned".to_string())
            })?;
            pending.insert(
                question_id.clone(),
                PendingEntry {
                    question,
                    reply: tx,
                },
            );
        }

        let result = tokio::select! {
            answer = rx => answer.map_err(|_| {
                WaymarkError::Runtime("question answer channel closed".to_string())
            }),
            _ = cancel.cancelled() => Err(WaymarkError::Canceled(
                "cancelled while waiting for an answer".to_string(),
            )),
        };

        if result.is_err() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&question_id);
            }
        }
        result
    }
}
