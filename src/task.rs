use std::fmt;
use std::sync::Arc;

use futures::TryStreamExt;
use serde_json::{Value, json};
use tracing::debug;

use crate::http::{HttpClient, HttpRequest, HttpResponse, ResponseCheck, ResponseFilter};
use crate::pagination::{CursorExtractor, JsonFieldCursor, PaginatedCaller};
use crate::sensor::PollingSensor;
use crate::{FlowError, RetryPolicy, TaskOutput};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskKind {
    SingleCall,
    PollingSensor(PollingSensor),
    PaginatedCall(PaginatedCaller),
}

/// One node of a task graph: a request, how to run it, and how to judge
/// its responses. Immutable once added to a graph.
#[derive(Clone)]
pub struct Task {
    id: String,
    kind: TaskKind,
    request: HttpRequest,
    retry_policy: RetryPolicy,
    upstream: Vec<String>,
    check_status: bool,
    response_check: Option<Arc<dyn ResponseCheck>>,
    response_filter: Option<Arc<dyn ResponseFilter>>,
    cursor: Arc<dyn CursorExtractor>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("request", &self.request)
            .field("retry_policy", &self.retry_policy)
            .field("upstream", &self.upstream)
            .field("check_status", &self.check_status)
            .field("response_check", &self.response_check.is_some())
            .field("response_filter", &self.response_filter.is_some())
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new(id: impl Into<String>, kind: TaskKind, request: HttpRequest) -> Self {
        Self {
            id: id.into(),
            kind,
            request,
            retry_policy: RetryPolicy::default(),
            upstream: Vec::new(),
            check_status: true,
            response_check: None,
            response_filter: None,
            cursor: Arc::new(JsonFieldCursor::default()),
        }
    }

    pub fn single_call(id: impl Into<String>, request: HttpRequest) -> Self {
        Self::new(id, TaskKind::SingleCall, request)
    }

    pub fn sensor(id: impl Into<String>, request: HttpRequest, sensor: PollingSensor) -> Self {
        Self::new(id, TaskKind::PollingSensor(sensor), request)
    }

    pub fn paginated(id: impl Into<String>, request: HttpRequest, caller: PaginatedCaller) -> Self {
        Self::new(id, TaskKind::PaginatedCall(caller), request)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// When false, non-2xx responses are passed to the response check and
    /// filter instead of failing the attempt outright.
    pub fn with_check_status(mut self, check_status: bool) -> Self {
        self.check_status = check_status;
        self
    }

    pub fn with_response_check(mut self, check: impl ResponseCheck + 'static) -> Self {
        self.response_check = Some(Arc::new(check));
        self
    }

    pub fn with_response_filter(mut self, filter: impl ResponseFilter + 'static) -> Self {
        self.response_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_cursor(mut self, cursor: impl CursorExtractor + 'static) -> Self {
        self.cursor = Arc::new(cursor);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn upstream(&self) -> &[String] {
        &self.upstream
    }

    pub fn check_status(&self) -> bool {
        self.check_status
    }

    pub(crate) fn set_upstream(&mut self, upstream: Vec<String>) {
        self.upstream = upstream;
    }

    async fn fetch(
        &self,
        client: &dyn HttpClient,
        request: &HttpRequest,
    ) -> Result<HttpResponse, FlowError> {
        let response = client.request(request).await?;
        if self.check_status {
            response.error_for_status()
        } else {
            Ok(response)
        }
    }

    fn process(&self, response: &HttpResponse) -> Result<TaskOutput, FlowError> {
        if let Some(check) = &self.response_check {
            if !check.check(response)? {
                return Err(FlowError::ResponseCheck(format!(
                    "check returned false for {} (status {})",
                    self.id, response.status
                )));
            }
        }

        match &self.response_filter {
            Some(filter) => filter.filter(response),
            None => Ok(response.to_value()),
        }
    }

    /// One request, checked and filtered.
    pub async fn call_once(&self, client: &dyn HttpClient) -> Result<TaskOutput, FlowError> {
        let response = self.fetch(client, &self.request).await?;
        self.process(&response)
    }

    /// Follows cursors from the task's request and collects the output of
    /// every page, in call order.
    pub async fn call_paginated(
        &self,
        client: &dyn HttpClient,
        caller: &PaginatedCaller,
    ) -> Result<TaskOutput, FlowError> {
        let mut pages = std::pin::pin!(caller.run(
            self.request.clone(),
            move |request: HttpRequest| async move { self.fetch(client, &request).await },
            Arc::clone(&self.cursor),
        ));

        let mut outputs = Vec::new();
        while let Some(page) = pages.try_next().await? {
            outputs.push(self.process(&page)?);
        }
        debug!(task = %self.id, pages = outputs.len(), "pagination finished");

        Ok(Value::Array(outputs))
    }

    /// Fetches one page of a paginated call. Returns the page output and
    /// the request for the following page, if the response carries a cursor.
    pub async fn fetch_page(
        &self,
        client: &dyn HttpClient,
        request: &HttpRequest,
    ) -> Result<(TaskOutput, Option<HttpRequest>), FlowError> {
        let response = self.fetch(client, request).await?;
        let next = self
            .cursor
            .next_page(&response)
            .map(|page| page.apply(request));
        Ok((self.process(&response)?, next))
    }

    /// A single sensor poke. Without a response check the sensor is
    /// satisfied by any 2xx response.
    pub async fn poke(&self, client: &dyn HttpClient) -> Result<bool, FlowError> {
        let response = self.fetch(client, &self.request).await?;
        match &self.response_check {
            Some(check) => check.check(&response),
            None => Ok(response.is_success()),
        }
    }

    pub(crate) fn sensor_output(pokes: u32) -> TaskOutput {
        json!({ "pokes": pokes })
    }
}
