use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;
use unicorn_board::{
    BoardClient, HttpRemote, Notice, NoticeLevel, Notifier, QueryCache, RecoveryService, live,
};
use unicorn_core::{Column, DragGesture, Priority, ProjectId, TaskId};
use unicorn_protocol::{CreateTaskRequest, UpdateTaskRequest};

#[derive(Debug, Parser)]
#[command(name = "unicorn-board", about = "Solo Unicorn board client")]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8800")]
    server: String,
    #[arg(long)]
    project: ProjectId,
    /// How long a reachability check may take before recovery gives up.
    #[arg(long, default_value_t = 3000)]
    probe_timeout_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the board, one column at a time.
    List,
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<u8>,
        #[arg(long)]
        status: Option<Column>,
    },
    /// Drag a task before another task, or to the end of a column.
    Move {
        #[arg(long)]
        task: String,
        #[arg(long, conflicts_with = "column", required_unless_present = "column")]
        before: Option<String>,
        #[arg(long)]
        column: Option<Column>,
    },
    Edit {
        #[arg(long)]
        task: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<u8>,
        #[arg(long)]
        status: Option<Column>,
    },
    Remove {
        #[arg(long)]
        task: String,
    },
    /// Follow live board events and reprint the board after each one.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let (notifier, mut notices) = Notifier::channel();
    let client = BoardClient::new(HttpRemote::new(cli.server.clone()), QueryCache::new(), notifier);
    let project = cli.project;

    client.refresh(project).await.context("failed to load board")?;

    let outcome = run(&client, &cli, project).await;
    print_notices(&mut notices);

    if !client.pending().is_empty() {
        let recovery = RecoveryService::new(client.clone())
            .with_probe_timeout(Duration::from_millis(cli.probe_timeout_ms));
        match recovery.drain().await {
            Ok(report) => info!(?report, "replayed failed mutations"),
            Err(err) => eprintln!("server still unreachable, {} change(s) not saved: {err}", client.pending().len()),
        }
    }

    outcome
}

async fn run(client: &BoardClient<HttpRemote>, cli: &Cli, project: ProjectId) -> Result<()> {
    match &cli.command {
        Command::List => print_board(client, project),
        Command::Add { title, description, priority, status } => {
            let mut request = CreateTaskRequest::new(project, title.clone());
            request.description = description.clone();
            request.priority = priority.map(Priority::new).transpose()?;
            request.status = *status;
            let task = client.create_task(request).await?;
            println!("created {} ({})", task.id, task.title);
        }
        Command::Move { task, before, column } => {
            let active = TaskId::from(task.as_str());
            let gesture = match (before, column) {
                (Some(target), _) => DragGesture::onto_task(active, TaskId::from(target.as_str())),
                (None, Some(column)) => DragGesture::onto_column(active, *column),
                (None, None) => anyhow::bail!("--before or --column is required"),
            };
            let moved = client.reorder(project, &gesture).await?;
            if moved.is_empty() {
                println!("nothing to move");
            } else {
                print_board(client, project);
            }
        }
        Command::Edit { task, title, description, priority, status } => {
            let patch = UpdateTaskRequest {
                title: title.clone(),
                description: description.clone(),
                status: *status,
                priority: priority.map(Priority::new).transpose()?,
                ..UpdateTaskRequest::default()
            };
            if patch.is_empty() {
                anyhow::bail!("nothing to change");
            }
            let updated = client.update_task(project, TaskId::from(task.as_str()), patch).await?;
            println!("updated {} ({})", updated.id, updated.title);
        }
        Command::Remove { task } => {
            client.delete_task(project, TaskId::from(task.as_str())).await?;
            println!("removed {task}");
        }
        Command::Watch => {
            print_board(client, project);
            live::watch(client, &cli.server, project, |event| {
                println!("-- {} --", event.kind.name());
                print_board(client, project);
            })
            .await?;
        }
    }
    Ok(())
}

fn print_board(client: &BoardClient<HttpRemote>, project: ProjectId) {
    for (column, tasks) in client.board(project) {
        println!("{column} ({})", tasks.len());
        for task in tasks {
            println!("  [p{}] {:<10} {}  {}", task.priority, task.order_key, task.id, task.title);
        }
    }
}

fn print_notices(notices: &mut UnboundedReceiver<Notice>) {
    while let Ok(notice) = notices.try_recv() {
        let label = match notice.level {
            NoticeLevel::Info => "info",
            NoticeLevel::Warning => "warning",
            NoticeLevel::Error => "error",
        };
        eprintln!("{label}: {}", notice.message);
    }
}
