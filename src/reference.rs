//! The chainable reference handle and its REST operations.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use derive_more::{Display, Error};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::{redirect, Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::{form_urlencoded, Url};

use crate::path::{escape_param, sanitize_url};

const DEFAULT_REDIRECT_LIMIT: usize = 30;
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(120);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// query parameter names understood by the REST endpoint
const AUTH_PARAM: &str = "auth";
const SHALLOW_PARAM: &str = "shallow";
const FORMAT_PARAM: &str = "format";
const FORMAT_VAL: &str = "export";
const ORDER_BY_PARAM: &str = "orderBy";
const LIMIT_TO_FIRST_PARAM: &str = "limitToFirst";
const LIMIT_TO_LAST_PARAM: &str = "limitToLast";
const START_AT_PARAM: &str = "startAt";
const END_AT_PARAM: &str = "endAt";
const EQUAL_TO_PARAM: &str = "equalTo";

/// Error carried in the response body when the database rejects a request.
///
/// The body text is propagated verbatim; retrieve it from an
/// [`anyhow::Error`] via `err.downcast_ref::<ServerError>()`.
#[derive(Clone, Debug, Display, Error, Eq, PartialEq)]
#[display(fmt = "server returned {} while {}: {}", status, context, body)]
pub struct ServerError {
    pub body: String,
    pub status: u16,
    pub context: String,
}

/// Connection establishment or response-header receipt exceeded the
/// request timeout. Detectable via `err.downcast_ref::<RequestTimeout>()`.
#[derive(Clone, Copy, Debug, Display, Error, Eq, PartialEq)]
#[display(fmt = "request timed out before response headers arrived")]
pub struct RequestTimeout;

/// A location in the remote tree.
///
/// References are produced by [`Ember::new`] and refined by
/// [`child`](Ember::child) and the query builders. Each derived reference
/// owns an independent copy of the query parameters while sharing the
/// underlying HTTP client, so decorating one reference never affects its
/// siblings.
pub struct Ember {
    pub(crate) url: String,
    pub(crate) params: BTreeMap<String, String>,
    pub(crate) client: Client,
    pub(crate) request_timeout: Duration,
    pub(crate) watch_heartbeat: Duration,
    pub(crate) event_funcs: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    pub(crate) next_registration: Arc<AtomicU64>,
    pub(crate) watching: Arc<Mutex<Option<CancellationToken>>>,
}

impl Ember {
    /// Create a reference to the root of the database at `url` (scheme
    /// defaults to `https://`).
    ///
    /// When no client is given, one is built that does not reuse
    /// connections; load balancers in front of the database are prone to
    /// half-closing pooled TLS connections. Redirects are chased by the
    /// library itself, up to 30 hops, replaying the request headers
    /// (notably `Accept` and `Authorization`) on every hop — the stock
    /// redirect handling drops credentials as soon as the target host
    /// changes. A custom client should have its own redirect handling
    /// disabled to keep that replay.
    pub fn new(url: &str, client: Option<Client>) -> Result<Ember> {
        let client = match client {
            Some(client) => client,
            None => Client::builder()
                .redirect(redirect::Policy::none())
                .pool_max_idle_per_host(0)
                .build()
                .context("building http client")?,
        };
        Ok(Ember {
            url: sanitize_url(url),
            params: BTreeMap::new(),
            client,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            watch_heartbeat: DEFAULT_HEARTBEAT,
            event_funcs: Arc::new(Mutex::new(HashMap::new())),
            next_registration: Arc::new(AtomicU64::new(0)),
            watching: Arc::new(Mutex::new(None)),
        })
    }

    fn copy(&self) -> Ember {
        Ember {
            url: self.url.clone(),
            // parameters are copied by value so that derived references
            // can be decorated independently
            params: self.params.clone(),
            client: self.client.clone(),
            request_timeout: self.request_timeout,
            watch_heartbeat: self.watch_heartbeat,
            event_funcs: Arc::new(Mutex::new(HashMap::new())),
            next_registration: Arc::new(AtomicU64::new(0)),
            watching: Arc::new(Mutex::new(None)),
        }
    }

    /// A reference to the requested child, configured like its parent.
    pub fn child(&self, path: &str) -> Ember {
        let mut child = self.copy();
        child.url = format!("{}/{}", self.url, path);
        child
    }

    /// Set the token used to authenticate against the database.
    pub fn auth(&mut self, token: &str) {
        self.params.insert(AUTH_PARAM.to_owned(), token.to_owned());
    }

    /// Remove the current authentication token.
    pub fn unauth(&mut self) {
        self.params.remove(AUTH_PARAM);
    }

    /// Maximum interval between stream frames before a watch connection is
    /// torn down and re-established (default two minutes).
    pub fn set_watch_heartbeat(&mut self, heartbeat: Duration) {
        self.watch_heartbeat = heartbeat;
    }

    /// Budget for connection establishment and response-header receipt
    /// (default 30 seconds).
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    fn with_param(&self, name: &str, value: &str) -> Ember {
        let mut reference = self.copy();
        if value.is_empty() {
            reference.params.remove(name);
        } else {
            reference
                .params
                .insert(name.to_owned(), escape_param(value));
        }
        reference
    }

    /// A copy of this reference returning values starting at `value`;
    /// the empty string removes the filter. String values are escaped,
    /// integers and booleans are passed through.
    pub fn start_at(&self, value: &str) -> Ember {
        self.with_param(START_AT_PARAM, value)
    }

    /// A copy of this reference returning values up to `value`; the empty
    /// string removes the filter.
    pub fn end_at(&self, value: &str) -> Ember {
        self.with_param(END_AT_PARAM, value)
    }

    /// A copy of this reference with server-side ordering by the given
    /// child key; the empty string removes the ordering.
    pub fn order_by(&self, value: &str) -> Ember {
        self.with_param(ORDER_BY_PARAM, value)
    }

    /// A copy of this reference returning only entries equal to `value`;
    /// the empty string removes the filter.
    pub fn equal_to(&self, value: &str) -> Ember {
        self.with_param(EQUAL_TO_PARAM, value)
    }

    /// A copy of this reference limited to the first `n` children; any
    /// `n <= 0` removes the limit.
    pub fn limit_to_first(&self, n: i64) -> Ember {
        let mut reference = self.copy();
        if n > 0 {
            reference
                .params
                .insert(LIMIT_TO_FIRST_PARAM.to_owned(), n.to_string());
        } else {
            reference.params.remove(LIMIT_TO_FIRST_PARAM);
        }
        reference
    }

    /// A copy of this reference limited to the last `n` children; any
    /// `n <= 0` removes the limit.
    pub fn limit_to_last(&self, n: i64) -> Ember {
        let mut reference = self.copy();
        if n > 0 {
            reference
                .params
                .insert(LIMIT_TO_LAST_PARAM.to_owned(), n.to_string());
        } else {
            reference.params.remove(LIMIT_TO_LAST_PARAM);
        }
        reference
    }

    /// Limit the depth of the data returned by [`value`](Ember::value):
    /// scalar locations come back as-is, object values are truncated to
    /// `true` per key.
    pub fn shallow(&mut self, v: bool) {
        if v {
            self.params
                .insert(SHALLOW_PARAM.to_owned(), "true".to_owned());
        } else {
            self.params.remove(SHALLOW_PARAM);
        }
    }

    /// Ask the database to include priority markers in returned values.
    pub fn include_priority(&mut self, v: bool) {
        if v {
            self.params
                .insert(FORMAT_PARAM.to_owned(), FORMAT_VAL.to_owned());
        } else {
            self.params.remove(FORMAT_PARAM);
        }
    }

    /// The request URL with the auth token masked. Error text and log
    /// lines carry this form; only the outgoing request sees the real
    /// credential.
    pub(crate) fn redacted_url(&self) -> String {
        let mut params = self.params.clone();
        if params.contains_key(AUTH_PARAM) {
            params.insert(AUTH_PARAM.to_owned(), REDACTED.to_owned());
        }
        let mut url = format!("{}/.json", self.url);
        if !params.is_empty() {
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params.iter())
                .finish();
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    pub(crate) async fn do_request(
        &self,
        method: Method,
        body: Option<Vec<u8>>,
        headers: &[(&str, &str)],
    ) -> Result<(HeaderMap, Bytes)> {
        let mut extra = HeaderMap::new();
        for (name, value) in headers {
            extra.insert(
                HeaderName::from_bytes(name.as_bytes()).context("invalid header name")?,
                HeaderValue::from_str(value).context("invalid header value")?,
            );
        }
        let redacted = self.redacted_url();

        let response = match tokio::time::timeout(
            self.request_timeout,
            execute_with_redirects(&self.client, method.clone(), &self.to_string(), extra, body),
        )
        .await
        {
            Err(_) => return Err(RequestTimeout.into()),
            Ok(response) => response?,
        };

        let status = response.status();
        let response_headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("reading body of {} {}", method, redacted))?;
        if status.is_success() {
            Ok((response_headers, bytes))
        } else {
            Err(ServerError {
                body: String::from_utf8_lossy(&bytes).into_owned(),
                status: status.as_u16(),
                context: format!("sending {} {}", method, redacted),
            }
            .into())
        }
    }

    /// Write `v` at this reference, replacing whatever is there.
    pub async fn set<T: Serialize + ?Sized>(&self, v: &T) -> Result<()> {
        let body = serde_json::to_vec(v).context("serializing value")?;
        self.do_request(Method::PUT, Some(body), &[]).await?;
        Ok(())
    }

    /// Merge the children of `v` into this reference.
    pub async fn update<T: Serialize + ?Sized>(&self, v: &T) -> Result<()> {
        let body = serde_json::to_vec(v).context("serializing value")?;
        self.do_request(Method::PATCH, Some(body), &[]).await?;
        Ok(())
    }

    /// Store `v` under an auto-generated child key and return a reference
    /// to that child.
    pub async fn push<T: Serialize + ?Sized>(&self, v: &T) -> Result<Ember> {
        #[derive(Deserialize)]
        struct PushResponse {
            name: String,
        }
        let body = serde_json::to_vec(v).context("serializing value")?;
        let (_, bytes) = self.do_request(Method::POST, Some(body), &[]).await?;
        let response: PushResponse =
            serde_json::from_slice(&bytes).context("decoding push response")?;
        Ok(self.child(&response.name))
    }

    /// Delete the data at this reference.
    pub async fn remove(&self) -> Result<()> {
        self.do_request(Method::DELETE, None, &[]).await?;
        Ok(())
    }

    /// Read the value at this reference.
    pub async fn value<T: DeserializeOwned>(&self) -> Result<T> {
        let (_, bytes) = self.do_request(Method::GET, None, &[]).await?;
        serde_json::from_slice(&bytes).context("decoding value")
    }

    /// Run a compare-and-swap style transaction at this reference.
    ///
    /// `update` receives the current value and returns the desired new
    /// value; the write only succeeds when the location is still unchanged
    /// (ETag match). On contention the whole cycle is retried, up to ten
    /// attempts in total. The closure may run multiple times, so it should
    /// be free of side effects.
    pub async fn transaction<F>(&self, mut update: F) -> Result<()>
    where
        F: FnMut(Value) -> Result<Value>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.run_transaction(&mut update).await {
                Ok(()) => return Ok(()),
                Err(err) if attempts >= 10 => {
                    return Err(err.context("running transaction"))
                }
                Err(err) => tracing::debug!(%err, attempts, "retrying transaction"),
            }
        }
    }

    async fn run_transaction<F>(&self, update: &mut F) -> Result<()>
    where
        F: FnMut(Value) -> Result<Value>,
    {
        let (headers, bytes) = self
            .do_request(Method::GET, None, &[("X-Firebase-ETag", "true")])
            .await?;
        let etag = headers
            .get("ETag")
            .ok_or_else(|| anyhow!("no etag returned by the database"))?
            .to_str()
            .context("decoding etag header")?
            .to_owned();
        let current: Value =
            serde_json::from_slice(&bytes).context("decoding current value")?;
        let next = update(current)?;
        let body = serde_json::to_vec(&next).context("serializing transaction result")?;
        self.do_request(Method::PUT, Some(body), &[("if-match", &etag)])
            .await?;
        Ok(())
    }
}

const REDACTED: &str = "[redacted]";

/// Mask the auth token in a request URL destined for error text or logs.
pub(crate) fn redact_url(url: &Url) -> String {
    if !url.query_pairs().any(|(k, _)| k == AUTH_PARAM) {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == AUTH_PARAM {
                REDACTED.to_owned()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();
    let mut redacted = url.clone();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

/// Send a request, chasing redirects by hand so that every hop carries the
/// original request headers. The automatic redirect handling strips
/// `Authorization` and friends whenever the target host changes, so hops
/// are re-issued as fresh requests instead, up to 30 of them.
pub(crate) async fn execute_with_redirects(
    client: &Client,
    mut method: Method,
    url: &str,
    headers: HeaderMap,
    mut body: Option<Vec<u8>>,
) -> Result<Response> {
    let mut url = Url::parse(url).context("parsing request url")?;
    let mut hops = 0;
    loop {
        let mut request = client
            .request(method.clone(), url.clone())
            .headers(headers.clone());
        if let Some(body) = &body {
            request = request.body(body.clone());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("sending {} {}", method, redact_url(&url)))?;
        if !response.status().is_redirection() {
            return Ok(response);
        }
        let location = match response
            .headers()
            .get(LOCATION)
            .and_then(|l| l.to_str().ok())
            .map(str::to_owned)
        {
            Some(location) => location,
            None => return Ok(response),
        };
        hops += 1;
        if hops > DEFAULT_REDIRECT_LIMIT {
            return Err(anyhow!("{} consecutive redirects", hops));
        }
        let status = response.status();
        url = url
            .join(&location)
            .with_context(|| format!("resolving redirect to {:?}", location))?;
        // a 303, and the legacy 301/302 on POST, re-issue as a body-less GET
        if status == StatusCode::SEE_OTHER
            || ((status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND)
                && method == Method::POST)
        {
            method = Method::GET;
            body = None;
        }
    }
}

impl fmt::Display for Ember {
    /// The effective request URL: `<url>/.json[?<params>]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/.json", self.url)?;
        if !self.params.is_empty() {
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.params.iter())
                .finish();
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Ember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ember").field("url", &self.url).finish()
    }
}
