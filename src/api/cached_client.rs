//! Cached project/task client that wraps ApiClient with query caching and
//! cache-aware mutations.

use color_eyre::Result;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{EntityCache, QueryKey};
use crate::config::Config;
use crate::error::ClientError;
use crate::mutation::{MutationClient, MutationRequest};
use crate::notify::Notifier;
use crate::query::{QueryClient, QueryObserver, QueryOptions};

use super::client::ApiClient;
use super::keys::{self, ApiQueryKey};
use super::types::{
  Board, NewProject, NewTask, Project, ProjectFilter, ProjectUpdate, Task, TaskFilter, TaskMove,
  TaskUpdate,
};
use super::validation;

/// Project/task client with transparent caching.
///
/// Reads go through the [`QueryClient`] (fresh data is served from the
/// cache, concurrent identical reads share one request). Writes are validated
/// first, then go through the [`MutationClient`], which invalidates the
/// affected lists and writes the returned entity into its detail key.
#[derive(Clone)]
pub struct CachedApiClient {
  inner: ApiClient,
  queries: QueryClient,
  mutations: MutationClient,
}

impl CachedApiClient {
  /// Create a client from configuration, sharing `cache` with the caller.
  pub fn new(config: &Config, cache: EntityCache, notifier: Arc<dyn Notifier>) -> Result<Self> {
    let inner = ApiClient::new(config)?;
    let queries = QueryClient::new(cache.clone())
      .with_stale_time(config.query.stale_time())
      .with_retry(config.query.retry_policy());
    let mutations = MutationClient::new(cache, notifier);

    Ok(Self::from_parts(inner, queries, mutations))
  }

  pub fn from_parts(inner: ApiClient, queries: QueryClient, mutations: MutationClient) -> Self {
    Self {
      inner,
      queries,
      mutations,
    }
  }

  pub fn queries(&self) -> &QueryClient {
    &self.queries
  }

  pub fn cache(&self) -> &EntityCache {
    self.queries.cache()
  }

  fn read_key(key: ApiQueryKey) -> QueryKey {
    debug!(query = %key.description(), "cached read");
    key.query_key()
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// List projects with caching.
  pub async fn list_projects(&self, filter: &ProjectFilter) -> Result<Vec<Project>, ClientError> {
    let key = Self::read_key(ApiQueryKey::Projects(filter.clone()));
    let inner = self.inner.clone();
    let filter = filter.clone();

    let projects = self
      .queries
      .fetch_query(&key, &QueryOptions::default(), move || {
        let inner = inner.clone();
        let filter = filter.clone();
        async move { inner.list_projects(&filter).await }
      })
      .await?;

    Ok(projects)
  }

  /// Get a single project with caching.
  pub async fn get_project(&self, id: u64) -> Result<Project, ClientError> {
    let key = Self::read_key(ApiQueryKey::Project(id));
    let inner = self.inner.clone();

    let project = self
      .queries
      .fetch_query(&key, &QueryOptions::default(), move || {
        let inner = inner.clone();
        async move { inner.get_project(id).await }
      })
      .await?;

    Ok(project)
  }

  /// List tasks with caching.
  pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, ClientError> {
    let key = Self::read_key(ApiQueryKey::Tasks(filter.clone()));
    let inner = self.inner.clone();
    let filter = filter.clone();

    let tasks = self
      .queries
      .fetch_query(&key, &QueryOptions::default(), move || {
        let inner = inner.clone();
        let filter = filter.clone();
        async move { inner.list_tasks(&filter).await }
      })
      .await?;

    Ok(tasks)
  }

  /// Get a single task with caching.
  pub async fn get_task(&self, id: u64) -> Result<Task, ClientError> {
    let key = Self::read_key(ApiQueryKey::Task(id));
    let inner = self.inner.clone();

    let task = self
      .queries
      .fetch_query(&key, &QueryOptions::default(), move || {
        let inner = inner.clone();
        async move { inner.get_task(id).await }
      })
      .await?;

    Ok(task)
  }

  /// Kanban board for a project, built from the (cached) task list.
  pub async fn board(&self, project_id: u64) -> Result<Board, ClientError> {
    let tasks = self.list_tasks(&TaskFilter::for_project(project_id)).await?;
    Ok(Board::from_tasks(project_id, tasks))
  }

  /// Load the unfiltered project and task lists unless they are fresh, so
  /// later reads (and the on-disk snapshot) have them.
  pub async fn warm(&self) -> Result<(), ClientError> {
    let projects = ApiQueryKey::Projects(ProjectFilter::default());
    let tasks = ApiQueryKey::Tasks(TaskFilter::default());
    let options = QueryOptions::default();
    let (projects_key, tasks_key) = (projects.query_key(), tasks.query_key());

    let project_api = self.inner.clone();
    let task_api = self.inner.clone();
    let (loaded_projects, loaded_tasks) = tokio::join!(
      self.queries.prefetch(&projects_key, &options, move || {
        let api = project_api.clone();
        async move { api.list_projects(&ProjectFilter::default()).await }
      }),
      self.queries.prefetch(&tasks_key, &options, move || {
        let api = task_api.clone();
        async move { api.list_tasks(&TaskFilter::default()).await }
      }),
    );
    loaded_projects?;
    loaded_tasks?;

    self.mutations.notifier().info(&format!(
      "Cached {} and {}",
      projects.description(),
      tasks.description()
    ));
    Ok(())
  }

  /// Observer for a project list, for poll-driven UIs.
  pub fn observe_projects(&self, filter: ProjectFilter) -> QueryObserver<Vec<Project>> {
    let key = Self::read_key(ApiQueryKey::Projects(filter.clone()));
    let inner = self.inner.clone();
    QueryObserver::new(self.queries.clone(), key, move || {
      let inner = inner.clone();
      let filter = filter.clone();
      async move { inner.list_projects(&filter).await }
    })
  }

  /// Observer for a task list, for poll-driven UIs.
  pub fn observe_tasks(&self, filter: TaskFilter) -> QueryObserver<Vec<Task>> {
    let key = Self::read_key(ApiQueryKey::Tasks(filter.clone()));
    let inner = self.inner.clone();
    QueryObserver::new(self.queries.clone(), key, move || {
      let inner = inner.clone();
      let filter = filter.clone();
      async move { inner.list_tasks(&filter).await }
    })
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  pub async fn create_project(&self, input: NewProject) -> Result<Project, ClientError> {
    let input = validation::new_project(input)?;
    let inner = self.inner.clone();
    let message = format!("Project \"{}\" created", input.name);

    let request = MutationRequest::new("project", input)
      .invalidate(keys::project_lists())
      .write_through(|p: &Project| ApiQueryKey::Project(p.id).query_key())
      .success_message(message)
      .error_context("Failed to create project");

    let project = self
      .mutations
      .mutate(request, |input| async move {
        inner.create_project(&input).await
      })
      .await?;

    Ok(project)
  }

  pub async fn update_project(&self, id: u64, input: ProjectUpdate) -> Result<Project, ClientError> {
    let input = validation::project_update(input)?;
    let inner = self.inner.clone();

    let request = MutationRequest::new("project", input)
      .invalidate(keys::project_lists())
      .write_through(|p: &Project| ApiQueryKey::Project(p.id).query_key())
      .success_message(format!("Project {} updated", id))
      .error_context(format!("Failed to update project {}", id));

    let project = self
      .mutations
      .mutate(request, |input| async move {
        inner.update_project(id, &input).await
      })
      .await?;

    Ok(project)
  }

  /// Delete a project. Its tasks go with it, so task lists are invalidated too.
  pub async fn delete_project(&self, id: u64) -> Result<(), ClientError> {
    let inner = self.inner.clone();

    let request = MutationRequest::<u64, ()>::new("project", id)
      .invalidate(keys::project_lists())
      .invalidate(keys::task_lists())
      .remove(ApiQueryKey::Project(id).query_key())
      .success_message(format!("Project {} deleted", id))
      .error_context(format!("Failed to delete project {}", id));

    self
      .mutations
      .mutate(request, |id| async move { inner.delete_project(id).await })
      .await?;

    Ok(())
  }

  pub async fn create_task(&self, input: NewTask) -> Result<Task, ClientError> {
    let input = validation::new_task(input)?;
    let inner = self.inner.clone();
    let message = format!("Task \"{}\" created", input.title);

    let request = MutationRequest::new("task", input)
      .invalidate(keys::task_lists())
      .write_through(|t: &Task| ApiQueryKey::Task(t.id).query_key())
      .success_message(message)
      .error_context("Failed to create task");

    let task = self
      .mutations
      .mutate(request, |input| async move {
        inner.create_task(&input).await
      })
      .await?;

    Ok(task)
  }

  pub async fn update_task(&self, id: u64, input: TaskUpdate) -> Result<Task, ClientError> {
    let input = validation::task_update(input)?;
    let inner = self.inner.clone();

    let request = MutationRequest::new("task", input)
      .invalidate(keys::task_lists())
      .write_through(|t: &Task| ApiQueryKey::Task(t.id).query_key())
      .success_message(format!("Task {} updated", id))
      .error_context(format!("Failed to update task {}", id));

    let task = self
      .mutations
      .mutate(request, |input| async move {
        inner.update_task(id, &input).await
      })
      .await?;

    Ok(task)
  }

  /// Move a task to another board column (or position within one).
  pub async fn move_task(&self, id: u64, input: TaskMove) -> Result<Task, ClientError> {
    let inner = self.inner.clone();
    let message = format!("Task {} moved to {}", id, input.status.label());

    let request = MutationRequest::new("task", input)
      .invalidate(keys::task_lists())
      .write_through(|t: &Task| ApiQueryKey::Task(t.id).query_key())
      .success_message(message)
      .error_context(format!("Failed to move task {}", id));

    let task = self
      .mutations
      .mutate(request, |input| async move {
        inner.move_task(id, &input).await
      })
      .await?;

    Ok(task)
  }

  pub async fn delete_task(&self, id: u64) -> Result<(), ClientError> {
    let inner = self.inner.clone();

    let request = MutationRequest::<u64, ()>::new("task", id)
      .invalidate(keys::task_lists())
      .remove(ApiQueryKey::Task(id).query_key())
      .success_message(format!("Task {} deleted", id))
      .error_context(format!("Failed to delete task {}", id));

    self
      .mutations
      .mutate(request, |id| async move { inner.delete_task(id).await })
      .await?;

    Ok(())
  }
}
