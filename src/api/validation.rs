//! Client-side form validation, applied before any write leaves the process.

use crate::error::ValidationError;

use super::types::{NewProject, NewTask, ProjectUpdate, TaskUpdate};

pub const PROJECT_NAME_MAX: usize = 100;
pub const PROJECT_DESCRIPTION_MAX: usize = 1000;
pub const TASK_TITLE_MAX: usize = 200;
pub const TASK_DESCRIPTION_MAX: usize = 5000;

/// Trims fields and checks a new project. Returns the normalized payload.
pub fn new_project(mut input: NewProject) -> Result<NewProject, ValidationError> {
  input.name = required("name", &input.name, PROJECT_NAME_MAX)?;
  input.description = optional("description", input.description, PROJECT_DESCRIPTION_MAX)?;
  Ok(input)
}

pub fn project_update(mut input: ProjectUpdate) -> Result<ProjectUpdate, ValidationError> {
  if let Some(name) = &input.name {
    input.name = Some(required("name", name, PROJECT_NAME_MAX)?);
  }
  input.description = clearable("description", input.description, PROJECT_DESCRIPTION_MAX)?;
  if input == ProjectUpdate::default() {
    return Err(ValidationError::new("update", "nothing to change"));
  }
  Ok(input)
}

pub fn new_task(mut input: NewTask) -> Result<NewTask, ValidationError> {
  input.title = required("title", &input.title, TASK_TITLE_MAX)?;
  input.description = optional("description", input.description, TASK_DESCRIPTION_MAX)?;
  input.assignee = input
    .assignee
    .map(|a| a.trim().to_string())
    .filter(|a| !a.is_empty());
  Ok(input)
}

pub fn task_update(mut input: TaskUpdate) -> Result<TaskUpdate, ValidationError> {
  if let Some(title) = &input.title {
    input.title = Some(required("title", title, TASK_TITLE_MAX)?);
  }
  input.description = clearable("description", input.description, TASK_DESCRIPTION_MAX)?;
  input.assignee = input
    .assignee
    .map(|a| a.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()));
  if input == TaskUpdate::default() {
    return Err(ValidationError::new("update", "nothing to change"));
  }
  Ok(input)
}

fn required(field: &'static str, value: &str, max: usize) -> Result<String, ValidationError> {
  let value = value.trim();
  if value.is_empty() {
    return Err(ValidationError::new(field, "is required"));
  }
  check_len(field, value, max)?;
  Ok(value.to_string())
}

fn optional(
  field: &'static str,
  value: Option<String>,
  max: usize,
) -> Result<Option<String>, ValidationError> {
  match value.as_deref().map(str::trim) {
    None | Some("") => Ok(None),
    Some(v) => {
      check_len(field, v, max)?;
      Ok(Some(v.to_string()))
    }
  }
}

/// Like `optional`, for update fields where a blank value means "clear it".
fn clearable(
  field: &'static str,
  value: Option<Option<String>>,
  max: usize,
) -> Result<Option<Option<String>>, ValidationError> {
  match value {
    None => Ok(None),
    Some(value) => optional(field, value, max).map(Some),
  }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
  if value.chars().count() > max {
    return Err(ValidationError::new(
      field,
      format!("must be at most {} characters", max),
    ));
  }
  Ok(())
}
