//! reqwest-backed transport.
//!
//! Writes go to the proxy at `POST /topics/{topic}/messages?key={key}&sync`.
//! Reads go to the cache at `GET /cache/v1/raw/{key}` and the bulk stream at
//! `GET /cache/v1/values`.

use crate::codec::GZIP_ENCODING;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use kkv_core::{
    ClientConfig, KkvError, KkvResult, KkvTransport, StreamingResponse, TransportResponse,
    WriteRequest,
};
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Url;
use std::collections::HashMap;
use tracing::debug;

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    cache_base: Url,
    proxy_base: Url,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> KkvResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| KkvError::transport("build", e))?;

        Ok(Self {
            client,
            cache_base: parse_base("cache_host", &config.cache_host)?,
            proxy_base: parse_base("proxy_host", &config.proxy_host)?,
        })
    }

    pub fn write_url(&self, topic: &str, key: &str) -> KkvResult<Url> {
        let mut url = with_segments(&self.proxy_base, &["topics", topic, "messages"])?;
        url.query_pairs_mut()
            .append_pair("key", key)
            .append_key_only("sync");
        Ok(url)
    }

    pub fn read_url(&self, key: &str) -> KkvResult<Url> {
        with_segments(&self.cache_base, &["cache", "v1", "raw", key])
    }

    pub fn values_url(&self) -> KkvResult<Url> {
        with_segments(&self.cache_base, &["cache", "v1", "values"])
    }
}

#[async_trait]
impl KkvTransport for HttpTransport {
    async fn write(&self, request: WriteRequest) -> KkvResult<TransportResponse> {
        let url = self.write_url(&request.topic, &request.key)?;
        let mut builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json");
        if request.gzip {
            builder = builder.header(CONTENT_ENCODING, GZIP_ENCODING);
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| KkvError::transport("put", e))?;
        let status = response.status().as_u16();
        let headers = lowercase_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| KkvError::transport("put", e))?;

        debug!(status = status, bytes = body.len(), "Proxy responded");
        Ok(with_headers(TransportResponse::new(status, body), headers))
    }

    async fn read(&self, key: &str) -> KkvResult<TransportResponse> {
        let url = self.read_url(key)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| KkvError::transport("get", e))?;
        let status = response.status().as_u16();
        let headers = lowercase_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| KkvError::transport("get", e))?;

        Ok(with_headers(TransportResponse::new(status, body), headers))
    }

    async fn open_value_stream(&self) -> KkvResult<StreamingResponse> {
        let url = self.values_url()?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| KkvError::transport("stream", e))?;
        let status = response.status().as_u16();
        let headers = lowercase_headers(response.headers());
        let body = response
            .bytes_stream()
            .map_err(|e| KkvError::transport("stream", e));

        let mut streaming = StreamingResponse::new(status, Box::pin(body));
        for (name, value) in headers {
            streaming = streaming.with_header(&name, value);
        }
        Ok(streaming)
    }
}

fn parse_base(field: &'static str, host: &str) -> KkvResult<Url> {
    Url::parse(host).map_err(|e| {
        KkvError::Config(kkv_core::ConfigError::InvalidValue {
            field,
            reason: e.to_string(),
        })
    })
}

fn with_segments(base: &Url, segments: &[&str]) -> KkvResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| KkvError::transport("url", format!("{} cannot be a base URL", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn lowercase_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn with_headers(mut response: TransportResponse, headers: HashMap<String, String>) -> TransportResponse {
    for (name, value) in headers {
        response = response.with_header(&name, value);
    }
    response
}
