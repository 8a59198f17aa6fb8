//! Plain stdin/stdout console
//!
//! Events are printed as they arrive. A line typed while an ask is pending
//! answers it; a line typed while a request runs is queued for the task.

use std::collections::HashSet;
use std::future::Future;
use std::io::Write;

use skein_task::message::ApiReqInfo;
use skein_task::{Ask, AskResponse, Say, TaskEvent, TaskHandle, UiMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

pub struct Console {
    input: mpsc::UnboundedReceiver<String>,
    input_closed: bool,
    verbose: bool,
}

impl Console {
    /// Console reading lines from stdin on a background task
    pub fn stdin(verbose: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self::from_channel(rx, verbose)
    }

    pub fn from_channel(input: mpsc::UnboundedReceiver<String>, verbose: bool) -> Self {
        Self {
            input,
            input_closed: false,
            verbose,
        }
    }

    /// Prompt for the next instruction. `None` on EOF or `/exit`.
    pub async fn read_instruction(&mut self) -> Option<String> {
        loop {
            print!("> ");
            let _ = std::io::stdout().flush();
            let line = self.input.recv().await?;
            let line = line.trim();
            match line {
                "" => continue,
                "/exit" | "/quit" => return None,
                _ => return Some(line.to_string()),
            }
        }
    }

    /// Poll `run` to completion while printing the task's events, routing
    /// typed input and turning Ctrl-C into an abort.
    pub async fn drive<F: Future>(&mut self, handle: &TaskHandle, run: F) -> F::Output {
        let mut events = handle.subscribe();
        let mut events_open = true;
        let mut printed = HashSet::new();
        tokio::pin!(run);

        loop {
            tokio::select! {
                output = &mut run => {
                    // Print whatever the final steps emitted
                    while let Ok(event) = events.try_recv() {
                        self.print_event(&event, &mut printed);
                    }
                    return output;
                }
                event = events.recv(), if events_open => match event {
                    Ok(event) => self.print_event(&event, &mut printed),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "console fell behind the event feed");
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
                line = self.input.recv(), if !self.input_closed => match line {
                    Some(line) => route_input(handle, &line),
                    None => {
                        self.input_closed = true;
                        if !handle.pending_asks().is_empty() {
                            abort_in_background(handle);
                        }
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("\n[aborting]");
                    abort_in_background(handle);
                }
            }
        }
    }

    fn print_event(&self, event: &TaskEvent, printed: &mut HashSet<i64>) {
        match event {
            TaskEvent::MessageCreated { message } | TaskEvent::MessageUpdated { message } => {
                if message.is_partial() || printed.contains(&message.ts) {
                    return;
                }
                if let Some(line) = render_message(message, self.verbose) {
                    printed.insert(message.ts);
                    println!("{}", line);
                }
            }
            TaskEvent::TaskAskPending { ask, .. } => {
                if let Some(hint) = ask_hint(*ask) {
                    println!("{}", hint);
                }
            }
            TaskEvent::ToolProgress { content, .. } if self.verbose => println!("  | {}", content),
            TaskEvent::TaskDelegated { child_task_id, .. } => {
                println!("[delegating to subtask {}]", short_id(child_task_id));
            }
            TaskEvent::TaskModeSwitched { mode, .. } => println!("[mode: {}]", mode),
            TaskEvent::TaskCompleted { metrics, .. } => println!(
                "[Tokens: {} in, {} out | Cost: ${:.4}]",
                metrics.total_tokens_in, metrics.total_tokens_out, metrics.total_cost
            ),
            TaskEvent::QueueChanged { len } if *len > 0 => println!("[{} message(s) queued]", len),
            _ => {}
        }
    }
}

fn abort_in_background(handle: &TaskHandle) {
    let handle = handle.clone();
    tokio::spawn(async move { handle.abort().await });
}

/// Answer the newest ask, or queue the line when nothing is asking
fn route_input(handle: &TaskHandle, line: &str) {
    if handle.pending_asks().is_empty() {
        let result = handle.queue_message(line.trim(), Vec::new());
        if !result.success {
            eprintln!("[queue is full; message dropped]");
        }
        return;
    }
    handle.respond_latest(parse_answer(line));
}

pub fn parse_answer(line: &str) -> AskResponse {
    match line.trim().to_lowercase().as_str() {
        "" | "y" | "yes" => AskResponse::yes(),
        "n" | "no" => AskResponse::no(),
        _ => AskResponse::message(line.trim(), Vec::new()),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn ask_hint(ask: Ask) -> Option<&'static str> {
    match ask {
        Ask::CompletionResult => Some("Accept the result? [Y/n] or type feedback"),
        Ask::ApiReqFailed => Some("Retry the request? [Y/n]"),
        Ask::MistakeLimitReached => Some("Type guidance for the model, or press enter to let it continue"),
        Ask::ResumeTask | Ask::ResumeCompletedTask => {
            Some("Press enter to resume, or type new instructions")
        }
        Ask::Followup | Ask::Tool | Ask::Command => Some("Answer [Y/n] or type a reply"),
        Ask::CommandOutput => None,
    }
}

fn render_message(message: &UiMessage, verbose: bool) -> Option<String> {
    let text = message.text.as_deref().unwrap_or_default();
    if let Some(ask) = message.ask_kind() {
        return match ask {
            Ask::CommandOutput | Ask::ResumeTask | Ask::ResumeCompletedTask => None,
            Ask::ApiReqFailed => Some(format!("Request failed: {}", text)),
            _ if text.is_empty() => None,
            _ => Some(format!("? {}", text)),
        };
    }

    match message.say_kind()? {
        Say::Text if text.is_empty() => None,
        Say::Text => Some(text.to_string()),
        Say::Reasoning if verbose => Some(format!("[thinking] {}", text)),
        Say::Error => Some(format!("Error: {}", text)),
        Say::Tool => Some(format!("[tool] {}", tool_summary(text))),
        Say::CompletionResult => Some(format!("\nResult:\n{}\n", text)),
        Say::CheckpointSaved => Some(format!("[checkpoint {}]", short_id(text))),
        Say::ApiReqRetried => Some("[retrying request]".to_string()),
        Say::ApiReqRetryDelayed if !text.is_empty() => Some(format!("[{}]", text)),
        Say::CondenseContext => Some("[context condensed]".to_string()),
        Say::CondenseContextError => Some(format!("[context condense failed: {}]", text)),
        Say::SlidingWindowTruncation => Some("[older messages dropped to fit the context window]".to_string()),
        Say::SubtaskResult => Some(format!("[subtask finished]\n{}", text)),
        Say::ApiReqStarted if verbose => {
            let info: ApiReqInfo = serde_json::from_str(text).ok()?;
            info.cost.map(|cost| format!("[request cost ${:.4}]", cost))
        }
        _ => None,
    }
}

/// `name(arguments)` from the engine's tool narration
fn tool_summary(text: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return text.to_string();
    };
    let name = value["tool"].as_str().unwrap_or("tool");
    let mut arguments = value["arguments"].to_string();
    if let Some((cut, _)) = arguments.char_indices().nth(120) {
        arguments.truncate(cut);
        arguments.push_str("...");
    }
    format!("{}({})", name, arguments)
}
