use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::FlowError;
use crate::http::{HttpRequest, HttpResponse};

/// Parameters taken from one page that select the next one. They are
/// merged into the body of the previous request, replacing keys it shares.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageCursor(Map<String, Value>);

impl PageCursor {
    pub fn new(params: Map<String, Value>) -> Self {
        Self(params)
    }

    pub fn single(key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut params = Map::new();
        params.insert(key.into(), value.into());
        Self(params)
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn apply(&self, previous: &HttpRequest) -> HttpRequest {
        let mut next = previous.clone();
        let mut body = match next.body.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (key, value) in &self.0 {
            body.insert(key.clone(), value.clone());
        }
        next.body = Some(Value::Object(body));
        next
    }
}

pub trait CursorExtractor: Send + Sync {
    /// `None` ends pagination after the current page.
    fn next_page(&self, response: &HttpResponse) -> Option<PageCursor>;
}

impl<F> CursorExtractor for F
where
    F: Fn(&HttpResponse) -> Option<PageCursor> + Send + Sync,
{
    fn next_page(&self, response: &HttpResponse) -> Option<PageCursor> {
        self(response)
    }
}

/// Reads the cursor from a top-level JSON field of the response and sends
/// it back under the same key. Missing, null, false and empty values end
/// pagination, as does a body that is not JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonFieldCursor {
    field: String,
}

impl JsonFieldCursor {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Default for JsonFieldCursor {
    fn default() -> Self {
        Self::new("cursor")
    }
}

impl CursorExtractor for JsonFieldCursor {
    fn next_page(&self, response: &HttpResponse) -> Option<PageCursor> {
        let body = response.json().ok()?;
        let cursor = body.get(&self.field)?;
        let present = match cursor {
            Value::Null | Value::Bool(false) => false,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            _ => true,
        };
        present.then(|| PageCursor::single(self.field.clone(), cursor.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginatedCaller {
    pub max_pages: usize,
}

impl Default for PaginatedCaller {
    fn default() -> Self {
        Self { max_pages: 1000 }
    }
}

/// Where a paginated task stands between two page fetches.
#[derive(Debug, Clone, Default)]
pub struct PageProgress {
    next: Option<HttpRequest>,
    fetched: usize,
    outputs: Vec<Value>,
}

impl PageProgress {
    pub fn fetched(&self) -> usize {
        self.fetched
    }

    pub fn outputs(&self) -> &[Value] {
        &self.outputs
    }

    /// Takes the collected page outputs, in call order.
    pub fn collected(&mut self) -> Value {
        Value::Array(std::mem::take(&mut self.outputs))
    }
}

impl PaginatedCaller {
    pub fn new(max_pages: usize) -> Self {
        Self { max_pages }
    }

    pub fn start(&self, initial: HttpRequest) -> PageProgress {
        PageProgress {
            next: Some(initial),
            ..Default::default()
        }
    }

    /// The request for the next page, or `None` once a page came back
    /// without a cursor. Asking past `max_pages` is `PaginationLimit`.
    pub fn next_request(&self, progress: &PageProgress) -> Result<Option<HttpRequest>, FlowError> {
        match &progress.next {
            None => Ok(None),
            Some(_) if progress.fetched >= self.max_pages => Err(FlowError::PaginationLimit {
                max_pages: self.max_pages,
            }),
            Some(request) => Ok(Some(request.clone())),
        }
    }

    pub fn record(&self, progress: &mut PageProgress, output: Value, next: Option<HttpRequest>) {
        progress.fetched += 1;
        progress.outputs.push(output);
        debug!(
            page = progress.fetched,
            more = next.is_some(),
            "recorded page"
        );
        progress.next = next;
    }

    /// Lazily fetches pages starting from `initial`. Each page is requested
    /// only when the stream is polled for it, and the stream ends after the
    /// first page without a cursor. Asking for a page past `max_pages`
    /// yields `PaginationLimit` and ends the stream.
    pub fn run<'a, C, Fut>(
        &self,
        initial: HttpRequest,
        call: C,
        cursor: Arc<dyn CursorExtractor + 'a>,
    ) -> impl Stream<Item = Result<HttpResponse, FlowError>> + 'a
    where
        C: FnMut(HttpRequest) -> Fut + 'a,
        Fut: Future<Output = Result<HttpResponse, FlowError>> + 'a,
    {
        let max_pages = self.max_pages;

        stream::try_unfold(
            (Some(initial), 0usize, call),
            move |(next, fetched, mut call)| {
                let cursor = Arc::clone(&cursor);
                async move {
                    let Some(request) = next else {
                        return Ok(None);
                    };
                    if fetched >= max_pages {
                        return Err(FlowError::PaginationLimit { max_pages });
                    }

                    let response = call(request.clone()).await?;
                    let next = cursor
                        .next_page(&response)
                        .map(|page| page.apply(&request));
                    debug!(
                        page = fetched + 1,
                        more = next.is_some(),
                        endpoint = %request.endpoint,
                        "fetched page"
                    );

                    Ok(Some((response, (next, fetched + 1, call))))
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves `{"page": n, "cursor": ...}` following `cursors`, recording the
    /// requests it saw.
    fn cursor_pages(
        cursors: Vec<Option<&'static str>>,
        seen: Arc<Mutex<Vec<HttpRequest>>>,
    ) -> impl FnMut(HttpRequest) -> std::future::Ready<Result<HttpResponse, FlowError>> {
        let mut page = 0;
        move |request| {
            seen.lock().unwrap().push(request);
            let cursor = cursors.get(page).copied().flatten();
            page += 1;
            let body = json!({ "page": page, "cursor": cursor });
            std::future::ready(Ok(HttpResponse::ok(body.to_string())))
        }
    }

    fn initial() -> HttpRequest {
        HttpRequest::new(Method::Get, "get").with_body(json!({ "cursor": "", "size": 10 }))
    }

    #[tokio::test]
    async fn stops_after_page_without_cursor() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let caller = PaginatedCaller::default();

        let pages: Vec<_> = caller
            .run(
                initial(),
                cursor_pages(vec![Some("c1"), Some("c2"), None], seen.clone()),
                Arc::new(JsonFieldCursor::default()),
            )
            .try_collect()
            .await
            .unwrap();

        assert_eq!(pages.len(), 3);
        let seen = seen.lock().unwrap();
        let sent: Vec<_> = seen
            .iter()
            .map(|r| r.body.as_ref().unwrap()["cursor"].clone())
            .collect();
        assert_eq!(sent, vec![json!(""), json!("c1"), json!("c2")]);
        // the rest of the body is carried along
        assert_eq!(seen[2].body.as_ref().unwrap()["size"], 10);
    }

    #[tokio::test]
    async fn page_limit_fails_when_a_cursor_would_continue() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let caller = PaginatedCaller::new(2);

        let mut pages = std::pin::pin!(caller.run(
            initial(),
            cursor_pages(vec![Some("c1"), Some("c2"), None], seen.clone()),
            Arc::new(JsonFieldCursor::default()),
        ));

        assert!(pages.try_next().await.unwrap().is_some());
        assert!(pages.try_next().await.unwrap().is_some());
        assert_eq!(
            pages.try_next().await.unwrap_err(),
            FlowError::PaginationLimit { max_pages: 2 }
        );
        assert!(pages.try_next().await.unwrap().is_none());
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exact_limit_is_not_an_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pages: Vec<_> = PaginatedCaller::new(2)
            .run(
                initial(),
                cursor_pages(vec![Some("c1"), None], seen),
                Arc::new(JsonFieldCursor::default()),
            )
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pages.len(), 2);
    }

    #[tokio::test]
    async fn nothing_is_fetched_until_polled() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let caller = PaginatedCaller::default();
        let pages = caller.run(
            initial(),
            cursor_pages(vec![None], seen.clone()),
            Arc::new(JsonFieldCursor::default()),
        );
        assert!(seen.lock().unwrap().is_empty());
        drop(pages);
    }

    #[test]
    fn progress_hands_out_one_page_at_a_time() {
        let caller = PaginatedCaller::new(2);
        let mut progress = caller.start(initial());

        let first = caller.next_request(&progress).unwrap().unwrap();
        assert_eq!(first, initial());

        let second = PageCursor::single("cursor", "c1").apply(&first);
        caller.record(&mut progress, json!(1), Some(second.clone()));
        assert_eq!(caller.next_request(&progress).unwrap(), Some(second));

        caller.record(&mut progress, json!(2), Some(initial()));
        assert_eq!(progress.fetched(), 2);
        assert_eq!(
            caller.next_request(&progress).unwrap_err(),
            FlowError::PaginationLimit { max_pages: 2 }
        );
        assert_eq!(progress.collected(), json!([1, 2]));
    }

    #[test]
    fn progress_ends_without_cursor() {
        let caller = PaginatedCaller::default();
        let mut progress = caller.start(initial());
        caller.record(&mut progress, json!("only"), None);
        assert_eq!(caller.next_request(&progress).unwrap(), None);
        assert_eq!(progress.outputs(), [json!("only")]);
    }

    #[test]
    fn json_cursor_ignores_empty_values() {
        let cursor = JsonFieldCursor::default();
        assert!(cursor.next_page(&HttpResponse::ok(r#"{"cursor":""}"#)).is_none());
        assert!(cursor.next_page(&HttpResponse::ok(r#"{"cursor":null}"#)).is_none());
        assert!(cursor.next_page(&HttpResponse::ok("not json")).is_none());
        assert_eq!(
            cursor.next_page(&HttpResponse::ok(r#"{"cursor":42}"#)),
            Some(PageCursor::single("cursor", 42))
        );
    }

    #[test]
    fn cursor_replaces_non_object_bodies() {
        let request = HttpRequest::new(Method::Get, "get").with_body("a=b");
        let next = PageCursor::single("cursor", "c1").apply(&request);
        assert_eq!(next.body, Some(json!({ "cursor": "c1" })));
    }
}
