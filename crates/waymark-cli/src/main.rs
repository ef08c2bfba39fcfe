use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use waymark::checkpoint::Checkpoint;
use waymark::engine::{Engine, EngineConfig, PipelineStatus, RunResult};
use waymark::events::{event_channel, EngineEvent, EventSink};
use waymark::interviewer::{AutoInterviewer, ConsoleInterviewer, Interviewer, QueueInterviewer};
use waymark::logsink::EventLogStore;
use waymark::parse::parse_dot;
use waymark::retry::RetryPolicy;
use waymark::state::{source_hash, RunStateStore};
use waymark::validate::ensure_valid;

#[derive(Parser, Debug)]
#[command(name = "waymark")]
#[command(about = "Run DOT-described agent pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse, validate, and execute a pipeline.
    Run(RunArgs),
    /// Resume a previously recorded run from its checkpoint.
    Resume(ResumeArgs),
    /// Print the contents of a checkpoint file.
    InspectCheckpoint(InspectCheckpointArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Path to a .dot pipeline file.
    #[arg(long)]
    dot_file: Option<PathBuf>,
    /// Inline DOT source (alternative to --dot-file).
    #[arg(long)]
    dot_source: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
    /// Base directory for run state, checkpoints, and artifacts.
    #[arg(long, default_value = ".waymark/runs")]
    runs_root: PathBuf,
    /// Skip hash-based auto-resume and start from scratch.
    #[arg(long, action = ArgAction::SetTrue)]
    fresh: bool,
    /// Named retry policy: none, default, aggressive, patient.
    #[arg(long)]
    retry: Option<String>,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    /// Emit events as JSON lines instead of the plain format.
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    #[arg(long, value_enum, default_value_t = InterviewerMode::Auto)]
    interviewer: InterviewerMode,
    /// Pre-scripted answers for the queue interviewer (repeatable).
    #[arg(long = "human-answer")]
    human_answers: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct ResumeArgs {
    /// Run id recorded in the runs root.
    run_id: String,
    #[arg(long, default_value = ".waymark/runs")]
    runs_root: PathBuf,
    #[arg(long)]
    retry: Option<String>,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    #[arg(long, value_enum, default_value_t = InterviewerMode::Auto)]
    interviewer: InterviewerMode,
    #[arg(long = "human-answer")]
    human_answers: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct InspectCheckpointArgs {
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InterviewerMode {
    Auto,
    Console,
    Queue,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Resume(args) => resume_command(args).await,
        Commands::InspectCheckpoint(args) => inspect_checkpoint_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let source = read_source(args.dot_file.as_deref(), args.dot_source.as_deref())?;
    let graph = parse_dot(&source)?;
    for diagnostic in ensure_valid(&graph)? {
        eprintln!(
            "warning: {}{}",
            diagnostic
                .node_id
                .as_deref()
                .map(|node| format!("{node}: "))
                .unwrap_or_default(),
            diagnostic.message
        );
    }

    let store = RunStateStore::new(&args.runs_root)?;
    let resume_from = if args.fresh {
        None
    } else {
        match store.find_resumable(&source_hash(&source))? {
            Some(previous) => {
                eprintln!(
                    "resuming run {} ({}) from its last checkpoint; pass --fresh to start over",
                    previous.id,
                    previous.status.as_str()
                );
                Some(store.checkpoint_path(&previous.id))
            }
            None => None,
        }
    };

    let mut config = EngineConfig {
        run_id: args.run_id,
        pipeline_file: args.dot_file.map(|path| path.display().to_string()),
        artifacts_base: Some(args.runs_root.clone()),
        state_store: Some(store),
        event_log: Some(Arc::new(EventLogStore::new(args.runs_root.join("events"))?)),
        interviewer: build_interviewer(args.interviewer, &args.human_answers),
        resume_from,
        ..EngineConfig::default()
    };
    if let Some(name) = args.retry.as_deref() {
        config.retry = RetryPolicy::named(name)
            .ok_or_else(|| format!("unknown retry policy '{name}'"))?;
    }

    let printer = if args.no_stream_events {
        None
    } else {
        let (sender, mut receiver) = event_channel();
        config.events = EventSink::with_sender(sender);
        let event_json = args.event_json;
        Some(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                print_event(&event, event_json);
            }
        }))
    };

    let result = Engine::new().run(&graph, config).await?;
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    print_summary(&result);
    Ok(exit_code_for(&result))
}

async fn resume_command(args: ResumeArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let store = RunStateStore::new(&args.runs_root)?;
    let previous = store.get(&args.run_id)?;
    let checkpoint_path = store.checkpoint_path(&args.run_id);
    if !checkpoint_path.exists() {
        return Err(format!("run '{}' has no checkpoint to resume from", args.run_id).into());
    }
    let graph = parse_dot(&previous.source)?;

    let mut config = EngineConfig {
        pipeline_file: previous.pipeline_file.clone(),
        artifacts_base: Some(args.runs_root.clone()),
        state_store: Some(store),
        event_log: Some(Arc::new(EventLogStore::new(args.runs_root.join("events"))?)),
        interviewer: build_interviewer(args.interviewer, &args.human_answers),
        resume_from: Some(checkpoint_path),
        ..EngineConfig::default()
    };
    if let Some(name) = args.retry.as_deref() {
        config.retry = RetryPolicy::named(name)
            .ok_or_else(|| format!("unknown retry policy '{name}'"))?;
    }

    let printer = if args.no_stream_events {
        None
    } else {
        let (sender, mut receiver) = event_channel();
        config.events = EventSink::with_sender(sender);
        let event_json = args.event_json;
        Some(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                print_event(&event, event_json);
            }
        }))
    };

    let result = Engine::new().run(&graph, config).await?;
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    print_summary(&result);
    Ok(exit_code_for(&result))
}

fn inspect_checkpoint_command(
    args: InspectCheckpointArgs,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let checkpoint = Checkpoint::load_from_path(&args.checkpoint)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("run:             {}", checkpoint.run_id);
    println!("saved at:        {}", checkpoint.timestamp);
    println!("current node:    {}", checkpoint.current_node);
    println!(
        "next node:       {}",
        checkpoint.next_node.as_deref().unwrap_or("-")
    );
    println!("completed nodes: {}", checkpoint.completed_nodes.join(", "));
    if let Some(status) = checkpoint.terminal_status.as_deref() {
        println!("terminal status: {status}");
    }
    if let Some(reason) = checkpoint.terminal_failure_reason.as_deref() {
        println!("failure reason:  {reason}");
    }
    Ok(ExitCode::SUCCESS)
}

fn read_source(
    dot_file: Option<&Path>,
    dot_source: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    match (dot_file, dot_source) {
        (Some(path), None) => Ok(std::fs::read_to_string(path)?),
        (None, Some(source)) => Ok(source.to_string()),
        (Some(_), Some(_)) => Err("pass either --dot-file or --dot-source, not both".into()),
        (None, None) => Err("one of --dot-file or --dot-source is required".into()),
    }
}

fn build_interviewer(mode: InterviewerMode, answers: &[String]) -> Arc<dyn Interviewer> {
    match mode {
        InterviewerMode::Auto => Arc::new(AutoInterviewer),
        InterviewerMode::Console => Arc::new(ConsoleInterviewer),
        InterviewerMode::Queue => {
            Arc::new(QueueInterviewer::with_answers(answers.iter().cloned()))
        }
    }
}

fn print_event(event: &EngineEvent, as_json: bool) {
    if as_json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
        return;
    }
    let node = event
        .node_id
        .as_deref()
        .map(|node_id| format!(" {node_id}"))
        .unwrap_or_default();
    let detail = event
        .data
        .get("reason")
        .or_else(|| event.data.get("error"))
        .or_else(|| event.data.get("notes"))
        .and_then(|value| value.as_str())
        .filter(|text| !text.is_empty())
        .map(|text| format!(" - {text}"))
        .unwrap_or_default();
    println!("[{}] {}{node}{detail}", event.timestamp, event.kind.as_str());
}

fn print_summary(result: &RunResult) {
    println!();
    println!("run:        {}", result.run_id);
    println!(
        "status:     {}",
        match result.status {
            PipelineStatus::Success => "success",
            PipelineStatus::Fail => "fail",
            PipelineStatus::Canceled => "canceled",
        }
    );
    println!("nodes:      {}", result.completed_nodes.join(" -> "));
    if let Some(reason) = result.failure_reason.as_deref() {
        println!("failure:    {reason}");
    }
    println!("events:     {}", result.events.len());
}

fn exit_code_for(result: &RunResult) -> ExitCode {
    match result.status {
        PipelineStatus::Success => ExitCode::SUCCESS,
        _ => ExitCode::from(1),
    }
}
