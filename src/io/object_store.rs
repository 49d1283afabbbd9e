use crate::types::{GvError, GvResult, SourceRef};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Payload of one fetched object
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub bytes: Vec<u8>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One entry of a bucket listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// Read-only access to the input bucket
pub trait ObjectStore: Send + Sync {
    /// Fetch the full object; a missing key is `NotYetAvailable`
    fn fetch(&self, source: &SourceRef) -> GvResult<FetchedObject>;

    /// All objects under a prefix, following continuation tokens
    fn list(&self, bucket: &str, prefix: &str) -> GvResult<Vec<ObjectSummary>>;
}

/// Anonymous S3-compatible HTTPS client
pub struct HttpObjectStore {
    client: reqwest::blocking::Client,
    endpoint_template: String,
}

impl HttpObjectStore {
    /// `endpoint_template` may contain `{bucket}`
    pub fn new(endpoint_template: &str, timeout: Duration) -> GvResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint_template: endpoint_template.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, bucket: &str) -> String {
        self.endpoint_template.replace("{bucket}", bucket)
    }
}

impl ObjectStore for HttpObjectStore {
    fn fetch(&self, source: &SourceRef) -> GvResult<FetchedObject> {
        let url = format!("{}/{}", self.endpoint(&source.bucket), source.key);
        log::debug!("GET {}", url);

        let response = self.client.get(&url).send()?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(GvError::NotYetAvailable(source.to_string()));
            }
            status if !status.is_success() => {
                return Err(GvError::Transport(format!("GET {} returned {}", url, status)));
            }
            _ => {}
        }

        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc));
        let bytes = response.bytes()?.to_vec();
        log::debug!("Fetched {} bytes from {}", bytes.len(), source);

        Ok(FetchedObject {
            bytes,
            last_modified,
        })
    }

    fn list(&self, bucket: &str, prefix: &str) -> GvResult<Vec<ObjectSummary>> {
        let url = format!("{}/", self.endpoint(bucket));
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut query = vec![("list-type", "2".to_string()), ("prefix", prefix.to_string())];
            if let Some(t) = &token {
                query.push(("continuation-token", t.clone()));
            }
            let response = self.client.get(&url).query(&query).send()?;
            if !response.status().is_success() {
                return Err(GvError::Transport(format!(
                    "Listing {} under {} returned {}",
                    bucket,
                    prefix,
                    response.status()
                )));
            }

            let (page, next) = parse_listing(&response.text()?)?;
            objects.extend(page);
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }

        log::debug!("Listed {} objects under {}/{}", objects.len(), bucket, prefix);
        Ok(objects)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListEntry>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
    last_modified: String,
}

/// Parse one `ListObjectsV2` page into entries plus the next continuation token
pub fn parse_listing(xml: &str) -> GvResult<(Vec<ObjectSummary>, Option<String>)> {
    let result: ListBucketResult = quick_xml::de::from_str(xml)
        .map_err(|e| GvError::Transport(format!("Unreadable bucket listing: {}", e)))?;

    let objects = result
        .contents
        .into_iter()
        .map(|entry| {
            DateTime::parse_from_rfc3339(&entry.last_modified)
                .map(|t| ObjectSummary {
                    key: entry.key,
                    last_modified: t.with_timezone(&Utc),
                })
                .map_err(|e| {
                    GvError::Transport(format!(
                        "Bad LastModified '{}' in listing: {}",
                        entry.last_modified, e
                    ))
                })
        })
        .collect::<GvResult<Vec<_>>>()?;

    let next = if result.is_truncated {
        result.next_continuation_token
    } else {
        None
    };
    Ok((objects, next))
}
