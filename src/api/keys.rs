//! Query keys for the project/task API.

use crate::cache::QueryKey;

use super::types::{ProjectFilter, TaskFilter};

/// Cacheable reads against the backend.
#[derive(Clone, Debug)]
pub enum ApiQueryKey {
  /// Project list, filtered
  Projects(ProjectFilter),
  /// A single project by id
  Project(u64),
  /// Task list, filtered
  Tasks(TaskFilter),
  /// A single task by id
  Task(u64),
}

impl ApiQueryKey {
  /// `["projects", {..}]`, `["project", id]`, `["tasks", {..}]`, `["task", id]`
  pub fn query_key(&self) -> QueryKey {
    match self {
      Self::Projects(filter) => QueryKey::new("projects").with(filter.params()),
      Self::Project(id) => QueryKey::new("project").with(*id),
      Self::Tasks(filter) => QueryKey::new("tasks").with(filter.params()),
      Self::Task(id) => QueryKey::new("task").with(*id),
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::Projects(filter) => match (&filter.status, &filter.search) {
        (None, None) => "all projects".to_string(),
        (Some(status), None) => format!("{} projects", status),
        (None, Some(search)) => format!("projects matching '{}'", search),
        (Some(status), Some(search)) => format!("{} projects matching '{}'", status, search),
      },
      Self::Project(id) => format!("project {}", id),
      Self::Tasks(filter) => match filter.project_id {
        Some(project_id) => format!("tasks for project {}", project_id),
        None => "all tasks".to_string(),
      },
      Self::Task(id) => format!("task {}", id),
    }
  }
}

/// Prefix covering every project list.
pub fn project_lists() -> QueryKey {
  QueryKey::new("projects")
}

/// Prefix covering every task list.
pub fn task_lists() -> QueryKey {
  QueryKey::new("tasks")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::TaskStatus;

  #[test]
  fn test_key_shapes() {
    assert_eq!(
      ApiQueryKey::Projects(ProjectFilter::default())
        .query_key()
        .to_string(),
      r#"["projects",{}]"#
    );
    assert_eq!(
      ApiQueryKey::Project(12).query_key().to_string(),
      r#"["project",12]"#
    );
  }

  #[test]
  fn test_list_keys_fall_under_prefixes() {
    let filter = TaskFilter {
      project_id: Some(4),
      status: Some(TaskStatus::Review),
      assignee: None,
    };
    assert!(ApiQueryKey::Tasks(filter).query_key().starts_with(&task_lists()));
    assert!(ApiQueryKey::Projects(ProjectFilter::default())
      .query_key()
      .starts_with(&project_lists()));
    assert!(!ApiQueryKey::Task(1).query_key().starts_with(&task_lists()));
  }

  #[test]
  fn test_equivalent_searches_share_a_key() {
    let a = ApiQueryKey::Projects(ProjectFilter {
      status: None,
      search: Some("Website".to_string()),
    });
    let b = ApiQueryKey::Projects(ProjectFilter {
      status: None,
      search: Some(" website ".to_string()),
    });
    assert_eq!(a.query_key(), b.query_key());
  }
}
