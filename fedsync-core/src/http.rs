//! HTTP repository client
//!
//! Talks to the repository REST API under a root URL such as
//! `https://repo.example.edu:8443/fedora`. Metadata is requested as XML,
//! content and exports are streamed in both directions.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt, TryStreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response, Url};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::client::{
    ByteStream, ContentSource, DatastreamContent, DatastreamInfo, DatastreamUpdate, ExportContext, RepositoryClient,
    RowStream,
};
use crate::error::{CHECKSUM_MISMATCH_LABEL, RepoError, Result};
use crate::model::{DatastreamDescriptor, DatastreamVersion, ObjectProfile, VersionRef, format_fedora_time};
use crate::profile;

const FOXML_FORMAT: &str = "info:fedora/fedora-system:FOXML-1.1";

/// Transport settings for [`HttpRepository`]
///
/// There is no whole-request timeout: exports, ingests and content uploads
/// run as long as data keeps moving.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub connect_timeout: Duration,
    /// Longest wait for the next read on a connection; `None` waits forever
    pub read_timeout: Option<Duration>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Some(Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS)),
        }
    }
}

/// Default idle read timeout, in seconds
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 120;

impl HttpOptions {
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// [`RepositoryClient`] over the repository REST API
pub struct HttpRepository {
    root: String,
    user: Option<String>,
    password: Option<String>,
    options: HttpOptions,
    http: reqwest::Client,
}

impl HttpRepository {
    pub fn new(root: &str, user: Option<&str>, password: Option<&str>) -> Result<Self> {
        Self::with_options(root, user, password, HttpOptions::default())
    }

    pub fn with_options(root: &str, user: Option<&str>, password: Option<&str>, options: HttpOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(options.connect_timeout);
        if let Some(timeout) = options.read_timeout {
            builder = builder.read_timeout(timeout);
        }
        let http = builder.build()?;
        Ok(Self {
            root: root.trim_end_matches('/').to_string(),
            user: user.map(str::to_string),
            password: password.map(str::to_string),
            options,
            http,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn options(&self) -> &HttpOptions {
        &self.options
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.root, path);
        let builder = self.http.request(method, url);
        match &self.user {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    /// Send a request, log it, and map error statuses
    async fn send(&self, method: Method, path: &str, builder: RequestBuilder) -> Result<Response> {
        let start = Instant::now();
        let resp = builder.send().await?;
        let status = resp.status();
        debug!(
            "{} {} => {} ({:.3}s)",
            method,
            path,
            status.as_u16(),
            start.elapsed().as_secs_f64()
        );
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(map_status(status.as_u16(), &body, path))
    }

    async fn get_xml(&self, path: &str, query: &[(&str, String)]) -> Result<Bytes> {
        let builder = self.request(Method::GET, path).query(&[("format", "xml")]).query(query);
        let resp = self.send(Method::GET, path, builder).await?;
        Ok(resp.bytes().await?)
    }

    fn content_request(builder: RequestBuilder, update: DatastreamUpdate) -> RequestBuilder {
        let mut builder = builder;
        if let Some(label) = &update.label {
            builder = builder.query(&[("dsLabel", label)]);
        }
        if let Some(mimetype) = &update.mimetype {
            builder = builder.query(&[("mimeType", mimetype)]);
        }
        if let Some(alg) = update.checksum_type {
            builder = builder.query(&[("checksumType", alg.name())]);
        }
        if let Some(msg) = &update.log_message {
            builder = builder.query(&[("logMessage", msg)]);
        }
        let mimetype = update
            .mimetype
            .unwrap_or_else(|| crate::model::DEFAULT_MIMETYPE.to_string());
        match update.content {
            Some(ContentSource::Location(url)) => builder.query(&[("dsLocation", url)]),
            Some(ContentSource::Bytes(data)) => builder.header(reqwest::header::CONTENT_TYPE, mimetype).body(data),
            Some(ContentSource::Stream { stream, size }) => {
                let mut builder = builder.header(reqwest::header::CONTENT_TYPE, mimetype);
                if let Some(size) = size {
                    builder = builder.header(reqwest::header::CONTENT_LENGTH, size);
                }
                builder.body(request_body(stream))
            }
            None => builder,
        }
    }

    /// Parse the datastream profile returned by a commit, falling back to a
    /// fresh profile request when the server answered with something else
    async fn committed_version(&self, pid: &str, dsid: &str, resp: Response) -> Result<VersionRef> {
        let body = resp.bytes().await?;
        match profile::parse_datastream_profile(dsid, &body) {
            Ok(info) => Ok(info.version.version_ref()),
            Err(_) => Ok(self.get_datastream_info(pid, dsid).await?.version.version_ref()),
        }
    }
}

/// Map an error status and response body to a [`RepoError`]
pub fn map_status(status: u16, body: &str, context: &str) -> RepoError {
    match status {
        404 => RepoError::NotFound(context.to_string()),
        401 | 403 => RepoError::PermissionDenied(context.to_string()),
        500 if body.contains(CHECKSUM_MISMATCH_LABEL) => RepoError::checksum_mismatch(body),
        _ => RepoError::RequestFailed {
            status,
            detail: body
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or(context)
                .to_string(),
        },
    }
}

fn response_stream(resp: Response) -> ByteStream {
    Box::pin(resp.bytes_stream().map_err(RepoError::from))
}

/// Feed a content stream to a request body through a bounded channel
fn request_body(stream: ByteStream) -> reqwest::Body {
    let (mut tx, rx) = futures::channel::mpsc::channel::<Result<Bytes>>(4);
    tokio::spawn(async move {
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(rx)
}

#[async_trait]
impl RepositoryClient for HttpRepository {
    async fn get_object(&self, pid: &str) -> Result<ObjectProfile> {
        let body = self.get_xml(&format!("objects/{}", pid), &[]).await?;
        profile::parse_object_profile(pid, &body)
    }

    async fn get_datastream_ids(&self, pid: &str) -> Result<Vec<String>> {
        let body = self.get_xml(&format!("objects/{}/datastreams", pid), &[]).await?;
        profile::parse_datastream_list(&body)
    }

    async fn get_datastream_info(&self, pid: &str, dsid: &str) -> Result<DatastreamInfo> {
        let body = self
            .get_xml(&format!("objects/{}/datastreams/{}", pid, dsid), &[])
            .await?;
        profile::parse_datastream_profile(dsid, &body)
    }

    async fn get_datastream_history(&self, pid: &str, dsid: &str) -> Result<Vec<DatastreamVersion>> {
        let body = self
            .get_xml(&format!("objects/{}/datastreams/{}/history", pid, dsid), &[])
            .await?;
        profile::parse_datastream_history(dsid, &body)
    }

    async fn get_datastream(
        &self,
        pid: &str,
        dsid: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<DatastreamContent> {
        let as_of: Vec<(&str, String)> = as_of
            .map(|ts| vec![("asOfDateTime", format_fedora_time(&ts))])
            .unwrap_or_default();

        let body = self
            .get_xml(&format!("objects/{}/datastreams/{}", pid, dsid), &as_of)
            .await?;
        let info = profile::parse_datastream_profile(dsid, &body)?;

        let path = format!("objects/{}/datastreams/{}/content", pid, dsid);
        let builder = self.request(Method::GET, &path).query(&as_of);
        let resp = self.send(Method::GET, &path, builder).await?;
        Ok(DatastreamContent {
            version: info.version,
            content: response_stream(resp),
        })
    }

    async fn add_datastream(
        &self,
        pid: &str,
        descriptor: &DatastreamDescriptor,
        update: DatastreamUpdate,
    ) -> Result<VersionRef> {
        let path = format!("objects/{}/datastreams/{}", pid, descriptor.id);
        let mut update = update;
        if update.label.is_none() {
            update.label = Some(descriptor.label.clone());
        }
        if update.mimetype.is_none() {
            update.mimetype = Some(descriptor.mimetype.clone());
        }

        let mut builder = self.request(Method::POST, &path).query(&[
            ("format", "xml"),
            ("controlGroup", descriptor.control_group.code()),
            ("versionable", if descriptor.versionable { "true" } else { "false" }),
            ("checksumType", descriptor.checksum_type.name()),
            ("dsState", descriptor.state.code()),
        ]);
        if let Some(format_uri) = &descriptor.format_uri {
            builder = builder.query(&[("formatURI", format_uri)]);
        }
        let builder = Self::content_request(builder, update);
        let resp = self.send(Method::POST, &path, builder).await?;
        self.committed_version(pid, &descriptor.id, resp).await
    }

    async fn modify_datastream(&self, pid: &str, dsid: &str, update: DatastreamUpdate) -> Result<VersionRef> {
        let path = format!("objects/{}/datastreams/{}", pid, dsid);
        let builder = self.request(Method::PUT, &path).query(&[("format", "xml")]);
        let builder = Self::content_request(builder, update);
        let resp = self.send(Method::PUT, &path, builder).await?;
        self.committed_version(pid, dsid, resp).await
    }

    async fn upload(&self, content: ByteStream, size: Option<u64>) -> Result<String> {
        let path = "upload";
        let body = request_body(content);
        let part = match size {
            Some(size) => Part::stream_with_length(body, size),
            None => Part::stream(body),
        };
        let form = Form::new().part("file", part.file_name("file"));
        let builder = self.request(Method::POST, path).multipart(form);
        let resp = self.send(Method::POST, path, builder).await?;
        let status = resp.status().as_u16();
        let id = resp.text().await?.trim().to_string();
        if status != 202 || id.is_empty() {
            return Err(RepoError::RequestFailed {
                status,
                detail: format!("Upload was not accepted: {}", id),
            });
        }
        debug!("Uploaded content as {}", id);
        Ok(id)
    }

    fn content_url(
        &self,
        pid: &str,
        dsid: &str,
        as_of: Option<DateTime<Utc>>,
        with_credentials: bool,
    ) -> Option<String> {
        let mut url = Url::parse(&format!("{}/objects/{}/datastreams/{}/content", self.root, pid, dsid)).ok()?;
        if let Some(ts) = as_of {
            url.query_pairs_mut().append_pair("asOfDateTime", &format_fedora_time(&ts));
        }
        if with_credentials {
            if let Some(user) = &self.user {
                url.set_username(user).ok()?;
                url.set_password(self.password.as_deref()).ok()?;
            }
        }
        Some(url.into())
    }

    async fn ingest(
        &self,
        pid: Option<&str>,
        serialization: ByteStream,
        log_message: Option<&str>,
    ) -> Result<String> {
        let path = format!("objects/{}", pid.unwrap_or("new"));
        let mut builder = self
            .request(Method::POST, &path)
            .query(&[("format", FOXML_FORMAT)])
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(request_body(serialization));
        if let Some(msg) = log_message {
            builder = builder.query(&[("logMessage", msg)]);
        }
        let resp = self.send(Method::POST, &path, builder).await?;
        Ok(resp.text().await?.trim().to_string())
    }

    async fn export(&self, pid: &str, context: ExportContext) -> Result<ByteStream> {
        let path = format!("objects/{}/export", pid);
        let builder = self
            .request(Method::GET, &path)
            .query(&[("context", context.as_str()), ("format", FOXML_FORMAT)]);
        let resp = self.send(Method::GET, &path, builder).await?;
        Ok(response_stream(resp))
    }

    async fn purge_object(&self, pid: &str, log_message: Option<&str>) -> Result<()> {
        let path = format!("objects/{}", pid);
        let mut builder = self.request(Method::DELETE, &path);
        if let Some(msg) = log_message {
            builder = builder.query(&[("logMessage", msg)]);
        }
        self.send(Method::DELETE, &path, builder).await?;
        Ok(())
    }

    async fn query(&self, query: &str) -> Result<RowStream> {
        let path = "risearch";
        let builder = self.request(Method::POST, path).query(&[
            ("type", "tuples"),
            ("lang", "sparql"),
            ("format", "CSV"),
            ("flush", "false"),
            ("query", query),
        ]);
        let resp = self.send(Method::POST, path, builder).await?;
        let text = resp.text().await?;
        let rows = profile::parse_csv_rows(&text);
        Ok(Box::pin(futures::stream::iter(rows.into_iter().map(Ok))))
    }
}
