//! This module provides a thin wrapper around the `reqwest` crate, giving
//! the driver blocking access to the problem service and the object storage
//! gateway.
//!

use std::io::Read;
use std::time::Duration;

use judge::{Error, ErrorKind, Result};
use sandbox::Context;

use crate::meta::{MetaService, ProblemMeta};
use crate::ports::ObjectStorage;

/// A blocking REST client with a fixed base URL and per-call timeout.
pub struct RestfulClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl RestfulClient {
    /// Create a client for the given base URL. Every request is bounded by
    /// `timeout`.
    pub fn new<U>(base_url: U, timeout: Duration) -> Result<Self>
        where U: Into<String> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::from(ErrorKind::System(format!(
                "failed to build http client: {}", e))))?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(RestfulClient { base_url, http })
    }

    /// Send a GET request to the given absolute path, e.g. `/problems/7`.
    fn get(&self, path: &str) -> Result<reqwest::blocking::Response> {
        let url = format!("{}{}", self.base_url, path);
        self.http.get(&url).send()
            .map_err(|e| Error::from(ErrorKind::System(format!(
                "request to {} failed: {}", url, e))))
    }
}

impl MetaService for RestfulClient {
    fn get_latest(&self, ctx: &Context, problem_id: i64) -> Result<ProblemMeta> {
        ctx.ensure_active().map_err(Error::from)?;

        let response = self.get(&format!("/problems/{}/latest", problem_id))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::from(ErrorKind::ProblemNotFound(problem_id)));
        }
        if !response.status().is_success() {
            return Err(Error::from(ErrorKind::System(format!(
                "problem service returned {} for problem {}",
                response.status(), problem_id))));
        }

        response.json().map_err(|e| Error::from(ErrorKind::System(format!(
            "malformed problem meta for {}: {}", problem_id, e))))
    }
}

/// Object storage accessed through an HTTP gateway: objects live under
/// `{base}/{bucket}/{key}`.
pub struct HttpObjectStorage {
    client: RestfulClient,
}

impl HttpObjectStorage {
    /// Create a storage client over the given gateway URL.
    pub fn new<U>(base_url: U, timeout: Duration) -> Result<Self>
        where U: Into<String> {
        Ok(HttpObjectStorage { client: RestfulClient::new(base_url, timeout)? })
    }
}

impl ObjectStorage for HttpObjectStorage {
    fn get_object(&self, ctx: &Context, bucket: &str, key: &str)
        -> Result<Box<dyn Read + Send>> {
        ctx.ensure_active().map_err(Error::from)?;

        let response = self.client.get(&format!("/{}/{}", bucket, key))?;
        if !response.status().is_success() {
            return Err(Error::from(ErrorKind::Cache(format!(
                "storage returned {} for {}/{}", response.status(), bucket, key))));
        }

        Ok(Box::new(response))
    }
}
