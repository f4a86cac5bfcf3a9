use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::FlowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    #[default]
    Post,
    Put,
    Delete,
    Patch,
    Head,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
        };
        f.write_str(name)
    }
}

/// A request as the engine sees it. The body is opaque: JSON objects,
/// form-encoded strings and query data all travel as a JSON value and are
/// encoded by the `HttpClient`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: Method,
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-2xx response into `FlowError::HttpStatus`.
    pub fn error_for_status(self) -> Result<Self, FlowError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FlowError::HttpStatus {
                status: self.status,
                body: self.body,
            })
        }
    }

    pub fn text(&self) -> &str {
        &self.body
    }

    pub fn json(&self) -> Result<Value, FlowError> {
        serde_json::from_str(&self.body).map_err(|e| FlowError::Decode(e.to_string()))
    }

    /// The body as JSON when it parses, otherwise as a plain string.
    pub fn to_value(&self) -> Value {
        self.json().unwrap_or_else(|_| Value::String(self.body.clone()))
    }
}

/// Transport seam. Implementations return `Ok` for every status code and
/// `FlowError::Transport` when no response was received at all.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, request: &HttpRequest) -> Result<HttpResponse, FlowError>;
}

/// Predicate over a response. A call task fails its attempt when this
/// returns `false`; a sensor treats it as its poke condition.
pub trait ResponseCheck: Send + Sync {
    fn check(&self, response: &HttpResponse) -> Result<bool, FlowError>;
}

impl<F> ResponseCheck for F
where
    F: Fn(&HttpResponse) -> Result<bool, FlowError> + Send + Sync,
{
    fn check(&self, response: &HttpResponse) -> Result<bool, FlowError> {
        self(response)
    }
}

/// Shapes the output a call task stores for a response.
pub trait ResponseFilter: Send + Sync {
    fn filter(&self, response: &HttpResponse) -> Result<Value, FlowError>;
}

impl<F> ResponseFilter for F
where
    F: Fn(&HttpResponse) -> Result<Value, FlowError> + Send + Sync,
{
    fn filter(&self, response: &HttpResponse) -> Result<Value, FlowError> {
        self(response)
    }
}
