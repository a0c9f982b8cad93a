//! Docker Hub repository search.
//!
//! Search is not part of the v2 registry protocol; Docker Hub serves it
//! from its own API. Pages link to each other through absolute `next` and
//! `previous` URLs, which [`SearchClient::page`] follows as given.

use crate::constants::{MAX_LISTING_SIZE, MAX_SEARCH_PAGE_SIZE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Longest query passed to the search endpoint.
const MAX_QUERY_LEN: usize = 255;

/// One repository in a search page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub repo_name: String,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub star_count: u64,
    #[serde(default)]
    pub pull_count: u64,
    #[serde(default)]
    pub repo_owner: Option<String>,
    #[serde(default)]
    pub is_official: bool,
    #[serde(default)]
    pub is_automated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchPage {
    /// Total matches across all pages.
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    #[serde(default)]
    pub results: Vec<SearchResult>,
}

pub struct SearchClient {
    http: reqwest::Client,
    url: String,
}

impl SearchClient {
    /// Client for the search endpoint at `url`.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("burrow/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, url: url.into() })
    }

    /// First page of repositories matching `query`.
    ///
    /// `page_size` is clamped to `1..=100`.
    pub async fn search(&self, query: &str, page_size: u32) -> Result<SearchPage> {
        let query = query.trim();
        if query.is_empty() || query.len() > MAX_QUERY_LEN || query.chars().any(char::is_control) {
            return Err(Error::InvalidSearchQuery(query.to_string()));
        }

        let page_size = page_size.clamp(1, MAX_SEARCH_PAGE_SIZE);
        let params = [("query", query.to_string()), ("page_size", page_size.to_string())];
        let url = reqwest::Url::parse_with_params(&self.url, &params)
            .map_err(|_| Error::InvalidRegistryUrl(self.url.clone()))?;
        self.fetch(url.as_str()).await
    }

    /// Page behind a `next` or `previous` link.
    pub async fn page(&self, url: &str) -> Result<SearchPage> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::InvalidRegistryUrl(url.to_string()));
        }
        self.fetch(url).await
    }

    async fn fetch(&self, url: &str) -> Result<SearchPage> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            message.truncate(512);
            return Err(Error::Registry {
                url: url.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        if body.len() > MAX_LISTING_SIZE {
            return Err(Error::Registry {
                url: url.to_string(),
                status: status.as_u16(),
                message: format!("body exceeds limit of {MAX_LISTING_SIZE} bytes"),
            });
        }

        let page: SearchPage = serde_json::from_slice(&body)?;
        debug!(results = page.results.len(), total = page.count, "search page fetched");
        Ok(page)
    }
}
