use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Project lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
  #[default]
  Active,
  OnHold,
  Completed,
  Archived,
}

impl ProjectStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Active => "active",
      Self::OnHold => "on_hold",
      Self::Completed => "completed",
      Self::Archived => "archived",
    }
  }
}

/// Task status; each one is a board column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  #[default]
  Todo,
  InProgress,
  Review,
  Done,
}

impl TaskStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Todo => "todo",
      Self::InProgress => "in_progress",
      Self::Review => "review",
      Self::Done => "done",
    }
  }

  /// Display label from the status table.
  pub fn label(self) -> &'static str {
    status_style(self).label
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
  Low,
  #[default]
  Medium,
  High,
  Urgent,
}

impl TaskPriority {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Low => "low",
      Self::Medium => "medium",
      Self::High => "high",
      Self::Urgent => "urgent",
    }
  }
}

/// How a task status is presented on the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusStyle {
  pub status: TaskStatus,
  pub label: &'static str,
  /// Short marker for terminal output
  pub badge: &'static str,
}

/// Board columns, in display order
pub const TASK_STATUSES: &[StatusStyle] = &[
  StatusStyle {
    status: TaskStatus::Todo,
    label: "To Do",
    badge: "[ ]",
  },
  StatusStyle {
    status: TaskStatus::InProgress,
    label: "In Progress",
    badge: "[~]",
  },
  StatusStyle {
    status: TaskStatus::Review,
    label: "Review",
    badge: "[?]",
  },
  StatusStyle {
    status: TaskStatus::Done,
    label: "Done",
    badge: "[x]",
  },
];

pub fn status_style(status: TaskStatus) -> &'static StatusStyle {
  TASK_STATUSES
    .iter()
    .find(|s| s.status == status)
    .unwrap_or(&TASK_STATUSES[0])
}

macro_rules! str_enum {
  ($ty:ty, $what:literal, [$($variant:path),+ $(,)?]) => {
    impl fmt::Display for $ty {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
      }
    }

    impl FromStr for $ty {
      type Err = String;

      fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        [$($variant),+]
          .into_iter()
          .find(|v| v.as_str() == normalized)
          .ok_or_else(|| format!("unknown {} '{}'", $what, s))
      }
    }
  };
}

str_enum!(ProjectStatus, "project status", [
  ProjectStatus::Active,
  ProjectStatus::OnHold,
  ProjectStatus::Completed,
  ProjectStatus::Archived,
]);
str_enum!(TaskStatus, "task status", [
  TaskStatus::Todo,
  TaskStatus::InProgress,
  TaskStatus::Review,
  TaskStatus::Done,
]);
str_enum!(TaskPriority, "priority", [
  TaskPriority::Low,
  TaskPriority::Medium,
  TaskPriority::High,
  TaskPriority::Urgent,
]);

/// Project as returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
  pub id: u64,
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub status: ProjectStatus,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Task as returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: u64,
  pub project_id: u64,
  pub title: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub status: TaskStatus,
  #[serde(default)]
  pub priority: TaskPriority,
  #[serde(default)]
  pub assignee: Option<String>,
  #[serde(default)]
  pub due_date: Option<NaiveDate>,
  /// Order within the status column
  #[serde(default)]
  pub position: u32,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Write payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewProject {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  /// `Some(None)` clears the description (sent as `null`)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<Option<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<ProjectStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewTask {
  pub project_id: u64,
  pub title: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  pub status: TaskStatus,
  pub priority: TaskPriority,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub assignee: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  /// `Some(None)` clears the description (sent as `null`)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<Option<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub priority: Option<TaskPriority>,
  /// `Some(None)` unassigns the task
  #[serde(skip_serializing_if = "Option::is_none")]
  pub assignee: Option<Option<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub due_date: Option<NaiveDate>,
}

/// Moving a card between (or within) board columns
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskMove {
  pub status: TaskStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub position: Option<u32>,
}

// ============================================================================
// Read filters
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectFilter {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<ProjectStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub search: Option<String>,
}

impl ProjectFilter {
  /// Normalized filter parameters, as used in query keys and query strings.
  pub fn params(&self) -> Value {
    let mut map = Map::new();
    if let Some(status) = self.status {
      map.insert("status".into(), status.as_str().into());
    }
    if let Some(search) = self.search.as_deref().map(normalize_search) {
      if !search.is_empty() {
        map.insert("search".into(), search.into());
      }
    }
    Value::Object(map)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskFilter {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub project_id: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<TaskStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub assignee: Option<String>,
}

impl TaskFilter {
  pub fn for_project(project_id: u64) -> Self {
    Self {
      project_id: Some(project_id),
      ..Self::default()
    }
  }

  pub fn params(&self) -> Value {
    let mut map = Map::new();
    if let Some(project_id) = self.project_id {
      map.insert("project_id".into(), project_id.into());
    }
    if let Some(status) = self.status {
      map.insert("status".into(), status.as_str().into());
    }
    if let Some(assignee) = self.assignee.as_deref().map(str::trim) {
      if !assignee.is_empty() {
        map.insert("assignee".into(), assignee.into());
      }
    }
    Value::Object(map)
  }
}

/// Trims and lowercases free-text search so equivalent searches share a cache slot.
fn normalize_search(search: &str) -> String {
  search.trim().to_lowercase()
}

// ============================================================================
// Board
// ============================================================================

/// One column of a kanban board
#[derive(Debug, Clone, PartialEq)]
pub struct BoardColumn {
  pub status: TaskStatus,
  pub label: &'static str,
  pub tasks: Vec<Task>,
}

/// Tasks of a project grouped by status
#[derive(Debug, Clone, PartialEq)]
pub struct Board {
  pub project_id: u64,
  pub columns: Vec<BoardColumn>,
}

impl Board {
  /// Group tasks into the status columns, ordered by position then id.
  /// Tasks from other projects are ignored.
  pub fn from_tasks(project_id: u64, tasks: Vec<Task>) -> Self {
    let mut columns: Vec<BoardColumn> = TASK_STATUSES
      .iter()
      .map(|style| BoardColumn {
        status: style.status,
        label: style.label,
        tasks: Vec::new(),
      })
      .collect();

    for task in tasks.into_iter().filter(|t| t.project_id == project_id) {
      if let Some(column) = columns.iter_mut().find(|c| c.status == task.status) {
        column.tasks.push(task);
      }
    }
    for column in &mut columns {
      column.tasks.sort_by_key(|t| (t.position, t.id));
    }

    Self {
      project_id,
      columns,
    }
  }

  pub fn task_count(&self) -> usize {
    self.columns.iter().map(|c| c.tasks.len()).sum()
  }
}
