//! Registry of server pushes awaiting a matching request.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use http::header::{self, HeaderName};
use http::{HeaderMap, Method, Request};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::transport::h2::stream::Stream;

/// Request headers that must agree between a promise and a request.
const DISTINGUISHING_HEADERS: [HeaderName; 5] = [
    header::ACCEPT,
    header::ACCEPT_ENCODING,
    header::ACCEPT_LANGUAGE,
    header::AUTHORIZATION,
    header::COOKIE,
];

fn sorted_query(query: Option<&str>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();
    pairs.sort();
    pairs
}

/// A promised request plus the stream reserved for its response.
#[derive(Debug)]
pub struct PushPromiseHeaders {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub stream: Arc<Stream>,
    pub promised_at: Instant,
}

impl PushPromiseHeaders {
    pub fn new(request: &Request<()>, stream: Arc<Stream>) -> Self {
        Self {
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            query: sorted_query(request.uri().query()),
            headers: request.headers().clone(),
            stream,
            promised_at: Instant::now(),
        }
    }

    pub fn promised_stream_id(&self) -> u32 {
        self.stream.id()
    }

    /// Same method, path and query parameters, and every distinguishing
    /// header value of the request appears in the promise.
    pub fn matches<B>(&self, request: &Request<B>) -> bool {
        if *request.method() != self.method || request.uri().path() != self.path {
            return false;
        }
        if sorted_query(request.uri().query()) != self.query {
            return false;
        }
        DISTINGUISHING_HEADERS.iter().all(|name| {
            request
                .headers()
                .get_all(name)
                .iter()
                .all(|value| self.headers.get_all(name).iter().any(|v| v == value))
        })
    }
}

/// Unclaimed pushes keyed by request path.
#[derive(Debug, Default)]
pub struct PushPromiseRegistry {
    promises: Mutex<HashMap<String, VecDeque<PushPromiseHeaders>>>,
}

impl PushPromiseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, promise: PushPromiseHeaders) {
        tracing::debug!(
            "push registry: stream {} promised for {} {}",
            promise.promised_stream_id(),
            promise.method,
            promise.path
        );
        self.promises
            .lock()
            .entry(promise.path.clone())
            .or_default()
            .push_back(promise);
    }

    /// Remove and return the oldest promise matching `request`.
    pub fn take_match<B>(&self, request: &Request<B>) -> Option<PushPromiseHeaders> {
        let mut promises = self.promises.lock();
        let path = request.uri().path();
        let candidates = promises.get_mut(path)?;
        let idx = candidates.iter().position(|p| p.matches(request))?;
        let promise = candidates.remove(idx);
        if candidates.is_empty() {
            promises.remove(path);
        }
        promise
    }

    /// Forget the promise bound to `stream_id` (peer reset it).
    pub fn remove_stream(&self, stream_id: u32) -> Option<PushPromiseHeaders> {
        let mut promises = self.promises.lock();
        let mut found = None;
        for candidates in promises.values_mut() {
            if let Some(idx) = candidates
                .iter()
                .position(|p| p.promised_stream_id() == stream_id)
            {
                found = candidates.remove(idx);
                break;
            }
        }
        promises.retain(|_, c| !c.is_empty());
        found
    }

    /// Drop promises older than `max_age`, then the oldest beyond `max_count`.
    /// Returns the streams whose promises were dropped.
    pub fn prune(&self, now: Instant, max_age: Duration, max_count: usize) -> Vec<Arc<Stream>> {
        let mut promises = self.promises.lock();
        let mut pruned = Vec::new();

        for candidates in promises.values_mut() {
            candidates.retain(|p| {
                let keep = now.duration_since(p.promised_at) <= max_age;
                if !keep {
                    pruned.push(Arc::clone(&p.stream));
                }
                keep
            });
        }

        let total: usize = promises.values().map(VecDeque::len).sum();
        if total > max_count {
            let mut ages: Vec<(Instant, u32)> = promises
                .values()
                .flat_map(|c| c.iter().map(|p| (p.promised_at, p.promised_stream_id())))
                .collect();
            ages.sort();
            let evict: Vec<u32> = ages
                .into_iter()
                .take(total - max_count)
                .map(|(_, id)| id)
                .collect();
            for candidates in promises.values_mut() {
                candidates.retain(|p| {
                    let keep = !evict.contains(&p.promised_stream_id());
                    if !keep {
                        pruned.push(Arc::clone(&p.stream));
                    }
                    keep
                });
            }
        }

        promises.retain(|_, c| !c.is_empty());
        if !pruned.is_empty() {
            tracing::debug!("push registry: pruned {} unclaimed promises", pruned.len());
        }
        pruned
    }

    /// Remove everything (session closing).
    pub fn drain(&self) -> Vec<PushPromiseHeaders> {
        self.promises
            .lock()
            .drain()
            .flat_map(|(_, c)| c.into_iter())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.promises.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
