use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use reqwest::StatusCode;

use super::{validate_key, validate_prefix, BlobStore};
use crate::error::StorageError;

/// Object storage reached over plain HTTP verbs (HEAD/GET/PUT/DELETE on
/// `{base_url}/{key}`), e.g. a presigned bucket gateway for S3 or R2.
/// Listing uses the ListObjectsV2 query on the bucket root.
pub struct HttpObjectStore {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| StorageError::Remote {
                path: base_url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn send(
        &self,
        path: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StorageError> {
        self.authed(req)
            .send()
            .await
            .map_err(|e| StorageError::Remote {
                path: path.to_string(),
                message: e.to_string(),
            })
    }
}

/// Page cap for one listing.
const MAX_LIST_PAGES: usize = 100;

/// One ListObjectsV2 page: keys plus the continuation token, if truncated.
fn parse_list_page(xml: &str) -> (Vec<String>, Option<String>) {
    static KEY: OnceCell<Regex> = OnceCell::new();
    static TRUNCATED: OnceCell<Regex> = OnceCell::new();
    static TOKEN: OnceCell<Regex> = OnceCell::new();
    let key_re = KEY.get_or_init(|| Regex::new(r"(?s)<Key>(.*?)</Key>").unwrap());
    let truncated_re = TRUNCATED.get_or_init(|| Regex::new(r"<IsTruncated>\s*true\s*</IsTruncated>").unwrap());
    let token_re =
        TOKEN.get_or_init(|| Regex::new(r"(?s)<NextContinuationToken>(.*?)</NextContinuationToken>").unwrap());

    let keys = key_re
        .captures_iter(xml)
        .map(|c| html_escape::decode_html_entities(c[1].trim()).into_owned())
        .collect();
    let next = if truncated_re.is_match(xml) {
        token_re
            .captures(xml)
            .map(|c| html_escape::decode_html_entities(c[1].trim()).into_owned())
    } else {
        None
    };
    (keys, next)
}

fn unexpected(path: &str, status: StatusCode) -> StorageError {
    StorageError::Remote {
        path: path.to_string(),
        message: format!("unexpected HTTP {}", status.as_u16()),
    }
}

#[async_trait]
impl BlobStore for HttpObjectStore {
    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let key = validate_key(path)?;
        let resp = self.send(path, self.http.head(self.url(key))).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(unexpected(path, s)),
        }
    }

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let key = validate_key(path)?;
        let req = self.http.put(self.url(key)).body(bytes.to_vec());
        let resp = self.send(path, req).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(unexpected(path, resp.status()))
        }
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let key = validate_key(path)?;
        let resp = self.send(path, self.http.get(self.url(key))).await?;
        match resp.status() {
            s if s.is_success() => {
                let body = resp.bytes().await.map_err(|e| StorageError::Remote {
                    path: path.to_string(),
                    message: e.to_string(),
                })?;
                Ok(body.to_vec())
            }
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(path.to_string())),
            s => Err(unexpected(path, s)),
        }
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        let key = validate_key(path)?;
        let resp = self.send(path, self.http.delete(self.url(key))).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(unexpected(path, s)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = validate_prefix(prefix)?;
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let mut query = vec![("list-type", "2".to_string()), ("prefix", prefix.to_string())];
            if let Some(t) = &token {
                query.push(("continuation-token", t.clone()));
            }
            let req = self.http.get(format!("{}/", self.base_url)).query(&query);
            let resp = self.send(prefix, req).await?;
            if !resp.status().is_success() {
                return Err(unexpected(prefix, resp.status()));
            }
            let body = resp.text().await.map_err(|e| StorageError::Remote {
                path: prefix.to_string(),
                message: e.to_string(),
            })?;
            let (page, next) = parse_list_page(&body);
            keys.extend(page.into_iter().filter(|k| k.starts_with(prefix)));
            match next {
                Some(t) => token = Some(t),
                None => {
                    keys.sort();
                    return Ok(keys);
                }
            }
        }
        Err(StorageError::Remote {
            path: prefix.to_string(),
            message: format!("listing exceeded {MAX_LIST_PAGES} pages"),
        })
    }

    async fn size(&self, path: &str) -> Result<Option<u64>, StorageError> {
        let key = validate_key(path)?;
        let resp = self.send(path, self.http.head(self.url(key))).await?;
        match resp.status() {
            s if s.is_success() => {
                let declared = resp
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok());
                match declared {
                    Some(n) => Ok(Some(n)),
                    // gateway without Content-Length on HEAD
                    None => Ok(Some(self.get(path).await?.len() as u64)),
                }
            }
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(unexpected(path, s)),
        }
    }

    fn locate(&self, path: &str) -> String {
        self.url(path)
    }

    fn name(&self) -> &'static str {
        "object"
    }
}
