//! In-process [`Fetcher`] that serves canned responses and records calls.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tracing::trace;

use crate::{Fetcher, NetError, Request, Response, Url};

#[derive(Debug, Clone)]
enum Route {
    Respond { status: StatusCode, body: Bytes },
    Fail(String),
}

/// Route table keyed by absolute URL.
///
/// Unknown URLs answer `404 Not Found`, like a static file server would.
#[derive(Debug, Default)]
pub struct MockFetcher {
    routes: HashMap<String, Route>,
    calls: Mutex<Vec<Url>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `url` with the given status and body.
    pub fn with_response(mut self, url: &Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        self.routes.insert(
            url.to_string(),
            Route::Respond {
                status,
                body: body.into(),
            },
        );
        self
    }

    /// Answer `url` with `200 OK`.
    pub fn with_ok(self, url: &Url, body: impl Into<Bytes>) -> Self {
        self.with_response(url, StatusCode::OK, body)
    }

    /// Fail `url` with a transport error.
    pub fn with_failure(mut self, url: &Url, message: &str) -> Self {
        self.routes
            .insert(url.to_string(), Route::Fail(message.to_string()));
        self
    }

    /// URLs fetched so far, in call order.
    pub fn calls(&self) -> Vec<Url> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of fetches so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        trace!(url = %request.url, "Mock fetch");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.url.clone());
        }

        match self.routes.get(request.url.as_str()) {
            Some(Route::Respond { status, body }) => Ok(Response::new(
                request.id,
                request.url,
                *status,
                HeaderMap::new(),
                body.clone(),
            )),
            Some(Route::Fail(message)) => Err(NetError::RequestFailed(message.clone())),
            None => Ok(Response::new(
                request.id,
                request.url,
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                Bytes::new(),
            )),
        }
    }
}
