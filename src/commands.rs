//! Command-line surface over the cached client.

use chrono::NaiveDate;
use clap::Subcommand;
use color_eyre::Result;

use taskdeck::api::types::{
  status_style, Board, NewProject, NewTask, Project, ProjectFilter, ProjectStatus, ProjectUpdate,
  Task, TaskFilter, TaskMove, TaskPriority, TaskStatus, TaskUpdate,
};
use taskdeck::api::CachedApiClient;
use taskdeck::cache::SqliteSnapshot;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Browse and edit projects
  #[command(subcommand, visible_alias = "p")]
  Projects(ProjectCommand),

  /// Browse and edit tasks
  #[command(subcommand, visible_alias = "t")]
  Tasks(TaskCommand),

  /// Show a project's tasks grouped by status
  #[command(visible_alias = "b")]
  Board { project_id: u64 },

  /// Inspect or clear the local cache
  #[command(subcommand)]
  Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
pub enum ProjectCommand {
  /// List projects
  #[command(visible_alias = "ls")]
  List {
    #[arg(long)]
    status: Option<ProjectStatus>,
    #[arg(short, long)]
    search: Option<String>,
  },
  /// Show one project
  Show { id: u64 },
  /// Create a project
  Create {
    name: String,
    #[arg(short, long)]
    description: Option<String>,
  },
  /// Change a project's fields
  Update {
    id: u64,
    #[arg(long)]
    name: Option<String>,
    /// New description (empty to clear)
    #[arg(short, long)]
    description: Option<String>,
    #[arg(long)]
    status: Option<ProjectStatus>,
  },
  /// Delete a project and its tasks
  #[command(visible_alias = "rm")]
  Delete { id: u64 },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
  /// List tasks
  #[command(visible_alias = "ls")]
  List {
    #[arg(short, long)]
    project: Option<u64>,
    #[arg(long)]
    status: Option<TaskStatus>,
    #[arg(short, long)]
    assignee: Option<String>,
  },
  /// Show one task
  Show { id: u64 },
  /// Create a task
  Create {
    project_id: u64,
    title: String,
    #[arg(short, long)]
    description: Option<String>,
    #[arg(long, default_value = "todo")]
    status: TaskStatus,
    #[arg(long, default_value = "medium")]
    priority: TaskPriority,
    #[arg(short, long)]
    assignee: Option<String>,
    /// Due date (YYYY-MM-DD)
    #[arg(long)]
    due: Option<NaiveDate>,
  },
  /// Change a task's fields
  Update {
    id: u64,
    #[arg(long)]
    title: Option<String>,
    /// New description (empty to clear)
    #[arg(short, long)]
    description: Option<String>,
    #[arg(long)]
    priority: Option<TaskPriority>,
    /// New assignee (empty to unassign)
    #[arg(short, long)]
    assignee: Option<String>,
    #[arg(long)]
    due: Option<NaiveDate>,
  },
  /// Move a task to another column
  #[command(visible_alias = "mv")]
  Move {
    id: u64,
    status: TaskStatus,
    #[arg(long)]
    position: Option<u32>,
  },
  /// Delete a task
  #[command(visible_alias = "rm")]
  Delete { id: u64 },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// Show what is cached
  Stats,
  /// Fetch the project and task lists for later offline use
  Warm,
  /// Drop every cached entry, in memory and on disk
  Clear,
}

/// Everything a command needs.
pub struct Context {
  pub client: CachedApiClient,
  pub snapshot: Option<SqliteSnapshot>,
}

pub async fn run(command: Command, ctx: &Context) -> Result<()> {
  match command {
    Command::Projects(cmd) => run_project(cmd, &ctx.client).await,
    Command::Tasks(cmd) => run_task(cmd, &ctx.client).await,
    Command::Board { project_id } => {
      let project = ctx.client.get_project(project_id).await?;
      let board = ctx.client.board(project_id).await?;
      print_board(&project, &board);
      Ok(())
    }
    Command::Cache(cmd) => run_cache(cmd, ctx).await,
  }
}

async fn run_project(cmd: ProjectCommand, client: &CachedApiClient) -> Result<()> {
  match cmd {
    ProjectCommand::List { status, search } => {
      let projects = client.list_projects(&ProjectFilter { status, search }).await?;
      if projects.is_empty() {
        println!("No projects");
      }
      for project in &projects {
        println!("{}", project_line(project));
      }
    }
    ProjectCommand::Show { id } => print_project(&client.get_project(id).await?),
    ProjectCommand::Create { name, description } => {
      let project = client
        .create_project(NewProject { name, description })
        .await?;
      println!("{}", project_line(&project));
    }
    ProjectCommand::Update {
      id,
      name,
      description,
      status,
    } => {
      let project = client
        .update_project(
          id,
          ProjectUpdate {
            name,
            description: description.map(Some),
            status,
          },
        )
        .await?;
      println!("{}", project_line(&project));
    }
    ProjectCommand::Delete { id } => client.delete_project(id).await?,
  }
  Ok(())
}

async fn run_task(cmd: TaskCommand, client: &CachedApiClient) -> Result<()> {
  match cmd {
    TaskCommand::List {
      project,
      status,
      assignee,
    } => {
      let tasks = client
        .list_tasks(&TaskFilter {
          project_id: project,
          status,
          assignee,
        })
        .await?;
      if tasks.is_empty() {
        println!("No tasks");
      }
      for task in &tasks {
        println!("{}", task_line(task));
      }
    }
    TaskCommand::Show { id } => print_task(&client.get_task(id).await?),
    TaskCommand::Create {
      project_id,
      title,
      description,
      status,
      priority,
      assignee,
      due,
    } => {
      let task = client
        .create_task(NewTask {
          project_id,
          title,
          description,
          status,
          priority,
          assignee,
          due_date: due,
        })
        .await?;
      println!("{}", task_line(&task));
    }
    TaskCommand::Update {
      id,
      title,
      description,
      priority,
      assignee,
      due,
    } => {
      let task = client
        .update_task(
          id,
          TaskUpdate {
            title,
            description: description.map(Some),
            priority,
            assignee: assignee.map(Some),
            due_date: due,
          },
        )
        .await?;
      println!("{}", task_line(&task));
    }
    TaskCommand::Move {
      id,
      status,
      position,
    } => {
      let task = client.move_task(id, TaskMove { status, position }).await?;
      println!("{}", task_line(&task));
    }
    TaskCommand::Delete { id } => client.delete_task(id).await?,
  }
  Ok(())
}

async fn run_cache(cmd: CacheCommand, ctx: &Context) -> Result<()> {
  let cache = ctx.client.cache();
  match cmd {
    CacheCommand::Stats => {
      let stats = cache.stats();
      println!("Entries:   {}", stats.entries);
      println!("Fresh:     {}", stats.fresh);
      println!("Stale:     {}", stats.stale);
      println!("Errored:   {}", stats.errored);
      let mut keys: Vec<String> = cache.keys().iter().map(|k| k.to_string()).collect();
      keys.sort();
      for key in keys {
        println!("  {}", key);
      }
      if ctx.snapshot.is_none() {
        println!("(persistence disabled)");
      }
    }
    CacheCommand::Warm => {
      ctx.client.warm().await?;
      if ctx.snapshot.is_none() {
        println!("(persistence disabled; nothing is kept after this run)");
      }
    }
    CacheCommand::Clear => {
      let count = cache.len();
      cache.clear();
      if let Some(snapshot) = &ctx.snapshot {
        snapshot.clear()?;
      }
      println!("Cleared {} cached entries", count);
    }
  }
  Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn project_line(project: &Project) -> String {
  format!("#{:<5} {:<10} {}", project.id, project.status, project.name)
}

fn task_line(task: &Task) -> String {
  let style = status_style(task.status);
  let assignee = task
    .assignee
    .as_deref()
    .map(|a| format!(" @{}", a))
    .unwrap_or_default();
  format!(
    "{} #{:<5} {:<7} {}{}",
    style.badge, task.id, task.priority, task.title, assignee
  )
}

fn print_project(project: &Project) {
  println!("{}", project.name);
  println!("  id:       {}", project.id);
  println!("  status:   {}", project.status);
  println!("  created:  {}", project.created_at.format("%Y-%m-%d %H:%M"));
  println!("  updated:  {}", project.updated_at.format("%Y-%m-%d %H:%M"));
  if let Some(description) = &project.description {
    println!();
    println!("{}", description);
  }
}

fn print_task(task: &Task) {
  println!("{}", task.title);
  println!("  id:       {}", task.id);
  println!("  project:  {}", task.project_id);
  println!("  status:   {}", task.status.label());
  println!("  priority: {}", task.priority);
  if let Some(assignee) = &task.assignee {
    println!("  assignee: {}", assignee);
  }
  if let Some(due) = task.due_date {
    println!("  due:      {}", due);
  }
  println!("  updated:  {}", task.updated_at.format("%Y-%m-%d %H:%M"));
  if let Some(description) = &task.description {
    println!();
    println!("{}", description);
  }
}

fn print_board(project: &Project, board: &Board) {
  println!("{} ({} tasks)", project.name, board.task_count());
  for column in &board.columns {
    println!();
    println!("{} ({})", column.label, column.tasks.len());
    for task in &column.tasks {
      println!("  {}", task_line(task));
    }
  }
}
