use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::QueryError;

use super::envelope::Envelope;
use super::types::{
  NewProject, NewTask, Project, ProjectFilter, ProjectUpdate, Task, TaskFilter, TaskMove,
  TaskUpdate,
};

/// REST client for the project/task backend.
///
/// Every call unwraps the response envelope, so callers only ever see the
/// payload or a [`QueryError`].
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    Self::with_base_url(
      &config.api.base_url,
      config.api.timeout(),
      Config::get_api_token(),
    )
  }

  pub fn with_base_url(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self> {
    let mut base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid base URL '{}': {}", base_url, e))?;
    // Url::join replaces the last segment unless the path ends in '/'
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      token,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, QueryError> {
    let url = self
      .base_url
      .join(path)
      .map_err(|e| QueryError::Transport(format!("Invalid request path '{}': {}", path, e)))?;
    let builder = self.http.request(method, url);
    Ok(match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    })
  }

  /// Send and unwrap the envelope.
  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, QueryError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    debug!(status = status.as_u16(), bytes = body.len(), "response received");

    match serde_json::from_str::<Envelope<T>>(&body) {
      Ok(envelope) if status.is_success() => envelope.into_result(),
      Ok(envelope) => Err(match envelope.message {
        Some(message) => QueryError::Envelope(message),
        None => http_error(status, &body),
      }),
      Err(e) if status.is_success() => Err(QueryError::Decode(e.to_string())),
      Err(_) => {
        // Failure bodies may still be envelopes without a typed payload
        match serde_json::from_str::<Envelope<Value>>(&body) {
          Ok(Envelope {
            message: Some(message),
            ..
          }) => Err(QueryError::Envelope(message)),
          _ => Err(http_error(status, &body)),
        }
      }
    }
  }

  async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, QueryError> {
    self.send(self.request(Method::GET, path)?).await
  }

  /// GET with filter parameters as the query string.
  async fn get_list<T: DeserializeOwned>(&self, path: &str, params: &Value) -> Result<T, QueryError> {
    self
      .send(self.request(Method::GET, path)?.query(params))
      .await
  }

  async fn with_body<T: DeserializeOwned, B: Serialize + ?Sized>(
    &self,
    method: Method,
    path: &str,
    body: &B,
  ) -> Result<T, QueryError> {
    self.send(self.request(method, path)?.json(body)).await
  }

  // ==========================================================================
  // Projects
  // ==========================================================================

  pub async fn list_projects(&self, filter: &ProjectFilter) -> Result<Vec<Project>, QueryError> {
    self.get_list("projects", &filter.params()).await
  }

  pub async fn get_project(&self, id: u64) -> Result<Project, QueryError> {
    self.get(&format!("projects/{}", id)).await
  }

  pub async fn create_project(&self, input: &NewProject) -> Result<Project, QueryError> {
    self.with_body(Method::POST, "projects", input).await
  }

  pub async fn update_project(&self, id: u64, input: &ProjectUpdate) -> Result<Project, QueryError> {
    self
      .with_body(Method::PUT, &format!("projects/{}", id), input)
      .await
  }

  pub async fn delete_project(&self, id: u64) -> Result<(), QueryError> {
    let _: Value = self
      .send(self.request(Method::DELETE, &format!("projects/{}", id))?)
      .await?;
    Ok(())
  }

  // ==========================================================================
  // Tasks
  // ==========================================================================

  pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueryError> {
    self.get_list("tasks", &filter.params()).await
  }

  pub async fn get_task(&self, id: u64) -> Result<Task, QueryError> {
    self.get(&format!("tasks/{}", id)).await
  }

  pub async fn create_task(&self, input: &NewTask) -> Result<Task, QueryError> {
    self.with_body(Method::POST, "tasks", input).await
  }

  pub async fn update_task(&self, id: u64, input: &TaskUpdate) -> Result<Task, QueryError> {
    self
      .with_body(Method::PUT, &format!("tasks/{}", id), input)
      .await
  }

  pub async fn move_task(&self, id: u64, input: &TaskMove) -> Result<Task, QueryError> {
    self
      .with_body(Method::PATCH, &format!("tasks/{}/move", id), input)
      .await
  }

  pub async fn delete_task(&self, id: u64) -> Result<(), QueryError> {
    let _: Value = self
      .send(self.request(Method::DELETE, &format!("tasks/{}", id))?)
      .await?;
    Ok(())
  }
}

fn http_error(status: reqwest::StatusCode, body: &str) -> QueryError {
  let message = body.trim();
  QueryError::Http {
    status: status.as_u16(),
    message: if message.is_empty() {
      status.canonical_reason().unwrap_or("Unknown error").to_string()
    } else {
      message.chars().take(200).collect()
    },
  }
}
