//! skein - run and resume model-driven tasks from the terminal

mod checkpoints;
mod config;
mod session;
mod tools;
mod ui;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use skein_ai::Model;
use skein_ai::providers::anthropic::AnthropicHandler;
use skein_task::{FileTaskStorage, Task, TaskOptions};
use tracing_subscriber::EnvFilter;

use crate::checkpoints::GitCheckpointService;
use crate::config::Config;
use crate::session::{ChildLauncher, Session, Step};
use crate::ui::Console;

/// skein - a task runner for coding models
#[derive(Parser, Debug)]
#[command(name = "skein")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// What the task should do
    prompt: Vec<String>,

    /// Model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Mode the task starts in
    #[arg(long)]
    mode: Option<String>,

    /// Resume a saved task by id
    #[arg(long, conflicts_with = "prompt")]
    resume: Option<String>,

    /// List saved tasks
    #[arg(long)]
    list: bool,

    /// Working directory
    #[arg(short, long)]
    working_dir: Option<PathBuf>,

    /// Do not take workspace checkpoints
    #[arg(long)]
    no_checkpoints: bool,

    /// Minimum seconds between model requests
    #[arg(long)]
    rate_limit: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "skein=debug" } else { "skein=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_system_prompt(tool_names: &[String], workspace: &Path) -> String {
    format!(
        "You are skein, a software engineering assistant working in {}.\n\n\
         Work in small steps and use one tool at a time when the result of one call decides the next. \
         Available tools: {}.\n\n\
         When the task is done, call attempt_completion with a summary of the outcome. \
         Use new_task to hand a self-contained sub-goal to a subtask, and switch_mode when a different mode \
         fits the work better.",
        workspace.display(),
        tool_names.join(", ")
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if args.init_config {
        let path = Config::init()?;
        println!("Config file created at: {}", path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let mut cfg = Config::load();
    let data_dir = cfg.data_dir();
    let storage = Arc::new(FileTaskStorage::new(&data_dir));

    if args.list {
        for id in storage.list_task_ids().await.context("listing saved tasks")? {
            println!("{}", id);
        }
        return Ok(());
    }

    if let Some(dir) = &args.working_dir {
        std::env::set_current_dir(dir).with_context(|| format!("changing to {}", dir.display()))?;
    }
    let workspace = std::env::current_dir().context("resolving the working directory")?;

    if let Some(mode) = args.mode {
        cfg.task.mode = mode;
    }
    if let Some(secs) = args.rate_limit {
        cfg.task.rate_limit_seconds = secs;
    }
    if args.no_checkpoints {
        cfg.task.enable_checkpoints = false;
    }

    let Some(api_key) = cfg.api_key() else {
        anyhow::bail!(
            "No API key found. Set ANTHROPIC_API_KEY or add it to {} (see skein --init-config)",
            Config::config_path().display()
        );
    };
    let model_id = args
        .model
        .or(cfg.model.clone())
        .unwrap_or_else(|| config::DEFAULT_MODEL.to_string());
    let api = Arc::new(AnthropicHandler::new(api_key, Model::anthropic(model_id)));

    let (task_id, first) = match args.resume {
        Some(id) => (id, Step::Resume),
        None => {
            let text = args.prompt.join(" ");
            if text.trim().is_empty() {
                anyhow::bail!("Nothing to do: pass a prompt, or --resume <id>");
            }
            (
                uuid::Uuid::new_v4().to_string(),
                Step::Start {
                    text,
                    images: Vec::new(),
                },
            )
        }
    };

    let tools = tools::registry(&workspace);
    let system_prompt = match cfg.system_prompt()? {
        Some(prompt) => prompt,
        None => build_system_prompt(&tools.names(), &workspace),
    };
    let launcher = Arc::new(ChildLauncher::new());
    let mut options = TaskOptions::new(api, storage)
        .with_task_id(&task_id)
        .with_config(cfg.task.clone())
        .with_system_prompt(system_prompt)
        .with_tools(tools)
        .with_delegator(launcher.clone());
    if cfg.task.enable_checkpoints {
        let git_dir = data_dir.join("tasks").join(&task_id).join("checkpoints");
        options = options.with_checkpoints(Arc::new(GitCheckpointService::new(git_dir, &workspace)));
    }

    let mut task = Task::new(options);
    eprintln!("skein task {}", task.task_id());

    let mut session = Session::new(Console::stdin(args.verbose), launcher);
    let outcome = session.run(&mut task, first).await;
    task.dispose().await;

    match outcome? {
        Some(_) => tracing::info!(task_id = %task_id, "task completed"),
        None => eprintln!("Resume later with: skein --resume {}", task_id),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_prompt_words() {
        let args = Args::parse_from(["skein", "--mode", "ask", "fix", "the", "build"]);
        assert_eq!(args.prompt.join(" "), "fix the build");
        assert_eq!(args.mode.as_deref(), Some("ask"));
    }

    #[test]
    fn test_resume_conflicts_with_prompt() {
        assert!(Args::try_parse_from(["skein", "--resume", "abc", "do", "it"]).is_err());
    }

    #[test]
    fn test_system_prompt_lists_tools() {
        let prompt = build_system_prompt(&["read_file".into(), "attempt_completion".into()], Path::new("/work"));
        assert!(prompt.contains("read_file, attempt_completion"));
        assert!(prompt.contains("/work"));
    }
}
