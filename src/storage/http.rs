//! Remote object storage over plain HTTP
//!
//! Speaks the minimal verb set shared by S3/GCS-compatible gateways:
//! `PUT`, `GET`, `HEAD`, `DELETE` on `{base}/{key}`, conditional create via
//! `If-None-Match: *`, and `GET {base}?prefix=` returning a JSON array of keys.

use super::{validate_key, ObjectStore};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use url::Url;

pub struct HttpStore {
    client: Client,
    base: Url,
    token: Option<SecretString>,
}

impl HttpStore {
    pub fn new(base: &str, token: Option<SecretString>) -> Result<Self> {
        // A trailing slash makes Url::join append instead of replace.
        let normalized = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{}/", base)
        };
        let base = Url::parse(&normalized)
            .map_err(|e| Error::Config(format!("invalid object store URL {}: {}", base, e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn url_for(&self, key: &str) -> Result<Url> {
        validate_key(key)?;
        self.base
            .join(key)
            .map_err(|e| Error::Storage(format!("bad key {}: {}", key, e)))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }

    fn check(resp: Response, key: &str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(Error::Transient(format!("object store {} on {}", status, key)))
        } else {
            Err(Error::Storage(format!("object store {} on {}", status, key)))
        }
    }
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn put_new(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        let req = self
            .client
            .put(self.url_for(key)?)
            .header(header::IF_NONE_MATCH, "*")
            .body(bytes.to_vec());
        let resp = self.authorize(req).send().await?;
        if resp.status() == StatusCode::PRECONDITION_FAILED || resp.status() == StatusCode::CONFLICT
        {
            return Ok(false);
        }
        Self::check(resp, key)?;
        Ok(true)
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let req = self.client.put(self.url_for(key)?).body(bytes.to_vec());
        let resp = self.authorize(req).send().await?;
        Self::check(resp, key)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let req = self.client.get(self.url_for(key)?);
        let resp = self.authorize(req).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check(resp, key)?;
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let req = self.client.head(self.url_for(key)?);
        let resp = self.authorize(req).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(resp, key)?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let req = self.client.delete(self.url_for(key)?);
        let resp = self.authorize(req).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp, key)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let req = self
            .client
            .get(self.base.clone())
            .query(&[("prefix", prefix)]);
        let resp = Self::check(self.authorize(req).send().await?, prefix)?;
        let mut keys: Vec<String> = resp.json().await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn locate(&self, key: &str) -> String {
        format!("{}{}", self.base, key)
    }

    fn key_for(&self, location: &str) -> Option<String> {
        let key = location.strip_prefix(self.base.as_str())?;
        validate_key(key).ok()?;
        Some(key.to_string())
    }
}
