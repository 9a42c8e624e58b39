//! Crawl provider integration: start crawl jobs, poll to completion, tag
//! and persist raw page shards.
//!
//! This is the only layer that retries transient provider errors; every
//! other provider call in the crate surfaces failures immediately.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::manifest::{write_manifest, CrawlManifest, CrawlScopeOutcome};
use crate::models::{Language, PageRecord, PageType};
use crate::shard::write_shard;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

static RETRY_AFTER_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)retry after (\d+)s").expect("static retry-after pattern"));

/// One retry schedule for the whole client, parameterized by status class.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    /// Delay before retry `attempt` (0-based): rate limits back off harder
    /// and honour any provider-supplied "retry after Ns" hint.
    pub fn delay(&self, attempt: usize, status: Option<StatusCode>, body: &str) -> Duration {
        if status == Some(StatusCode::TOO_MANY_REQUESTS) {
            let base = 5 + attempt as u64 * 5;
            let hinted = parse_retry_after_hint(body).unwrap_or(0);
            Duration::from_secs(base.max(hinted))
        } else {
            Duration::from_secs(2 + attempt as u64 * 2)
        }
    }
}

fn parse_retry_after_hint(body: &str) -> Option<u64> {
    RETRY_AFTER_HINT
        .captures(body)
        .and_then(|captures| captures.get(1))
        .and_then(|seconds| seconds.as_str().parse().ok())
}

/// Authenticated client for a Firecrawl-style crawl API.
pub struct CrawlClient {
    client: Client,
    base_url: String,
    policy: RetryPolicy,
}

impl CrawlClient {
    pub fn new(api_key: &str, base_url: &str, policy: RetryPolicy) -> Result<Self, PipelineError> {
        let base = url::Url::parse(base_url)?;
        let auth = format!("Bearer {}", api_key.trim());
        let key_value = HeaderValue::from_str(api_key.trim())
            .map_err(|_| PipelineError::Crawl("API key is not a valid header value".to_string()))?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| PipelineError::Crawl("API key is not a valid header value".to_string()))?,
        );
        headers.insert("x-api-key", key_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(180))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base.as_str().trim_end_matches('/').to_string(),
            policy,
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Option<&Value>,
    ) -> Result<Value, PipelineError> {
        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0usize;

        loop {
            let mut builder = self.client.request(method.clone(), &url);
            if let Some(body) = payload {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if status.is_success() {
                        if body.is_empty() {
                            return Ok(Value::Object(Default::default()));
                        }
                        return serde_json::from_str(&body).map_err(PipelineError::from);
                    }

                    if self.policy.is_retryable(status) && attempt + 1 < self.policy.max_attempts {
                        let delay = self.policy.delay(attempt, Some(status), &body);
                        warn!(%status, path, delay_secs = delay.as_secs(), "retrying crawl request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(PipelineError::Crawl(format!("HTTP {status} on {path}: {body}")));
                }
                Err(error) => {
                    if attempt + 1 < self.policy.max_attempts {
                        let delay = self.policy.delay(attempt, None, "");
                        warn!(%error, path, delay_secs = delay.as_secs(), "retrying crawl request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(error.into());
                }
            }
        }
    }

    pub async fn start_crawl(&self, payload: &Value) -> Result<Value, PipelineError> {
        self.request(Method::POST, "/crawl", Some(payload)).await
    }

    pub async fn crawl_status(&self, crawl_id: &str) -> Result<Value, PipelineError> {
        self.request(Method::GET, &format!("/crawl/{crawl_id}"), None).await
    }

    pub async fn poll_until_complete(&self, crawl_id: &str) -> Result<Value, PipelineError> {
        loop {
            let status = self.crawl_status(crawl_id).await?;
            if is_terminal_status(&status) {
                return Ok(status);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn is_terminal_status(status: &Value) -> bool {
    let state = status
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    matches!(state.as_str(), "completed" | "failed" | "cancelled")
}

/// One crawl scope: a named include/exclude path set with a page budget.
#[derive(Debug, Clone)]
pub struct CrawlScope {
    pub name: String,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub limit: u32,
}

const EXCLUDED_PATHS: &[&str] = &[
    "/cart",
    "/checkout",
    "/my-account",
    "/login",
    "/logout",
    "/register",
    "/password-reset",
    "/wishlist",
    "/compare",
    "/profile-",
    "/thank-you",
    "/thanks",
    "/color-1/",
    "/kind/",
    "/product-tag/",
    "/capacity-gb/",
    "/author/",
    "/mobile_banners/",
    "/mobile_promotions/",
    "/screen_splashes/",
    "/page/",
];

pub fn default_scopes() -> Vec<CrawlScope> {
    let excludes: Vec<String> = EXCLUDED_PATHS.iter().map(|path| path.to_string()).collect();
    let mut excludes_en = excludes.clone();
    excludes_en.push("/ar/".to_string());

    vec![
        CrawlScope {
            name: "products_en".to_string(),
            include_paths: vec!["/product/".to_string()],
            exclude_paths: excludes_en.clone(),
            limit: 90,
        },
        CrawlScope {
            name: "products_ar".to_string(),
            include_paths: vec!["/ar/product/".to_string()],
            exclude_paths: excludes.clone(),
            limit: 90,
        },
        CrawlScope {
            name: "pages_en".to_string(),
            include_paths: [
                "/shipping-policy",
                "/returns-replacements",
                "/terms-and-conditions",
                "/privacy-policy",
                "/contact-us",
                "/about-us",
                "/home-05",
                "/honor",
                "/product-category/",
                "/blackfriday-2025",
                "/valentine-2025",
                "/huawei-gt-6-series",
                "/honor-400-series",
            ]
            .iter()
            .map(|path| path.to_string())
            .collect(),
            exclude_paths: excludes_en,
            limit: 40,
        },
        CrawlScope {
            name: "pages_ar".to_string(),
            include_paths: [
                "/ar/honor",
                "/ar/%d8%a7%d9%84%d8%b1%d8%a6%d9%8a%d8%b3%d9%8a%d8%a9",
                "/ar/product-category/",
                "/ar/%d8%a7%d9%84%d8%a3%d8%ad%d9%83%d8%a7%d9%85-%d9%88%d8%a7%d9%84%d8%b4%d8%b1%d9%88%d8%b7",
            ]
            .iter()
            .map(|path| path.to_string())
            .collect(),
            exclude_paths: excludes,
            limit: 40,
        },
    ]
}

pub fn page_type_from_url(url: &str) -> PageType {
    if url.contains("/product/") {
        return PageType::Product;
    }
    if [
        "/shipping-policy",
        "/returns-replacements",
        "/terms-and-conditions",
        "/privacy-policy",
        "/contact-us",
        "/about-us",
    ]
    .iter()
    .any(|path| url.contains(path))
    {
        return PageType::PolicySupport;
    }
    if url.contains("/product-category/") {
        return PageType::Category;
    }
    if [
        "/home-05",
        "/honor",
        "/blackfriday-2025",
        "/valentine-2025",
        "/huawei-gt-6-series",
        "/honor-400-series",
        "/ar/honor",
        "/ar/%d8%a7%d9%84%d8%b1%d8%a6%d9%8a%d8%b3%d9%8a%d8%a9",
    ]
    .iter()
    .any(|path| url.contains(path))
    {
        return PageType::BrandCampaign;
    }
    PageType::Other
}

pub fn language_from_url(url: &str, metadata_language: Option<&str>) -> Language {
    if url.contains("/ar/") {
        return Language::Ar;
    }
    if metadata_language
        .map(|lang| lang.to_lowercase().starts_with("ar"))
        .unwrap_or(false)
    {
        return Language::Ar;
    }
    Language::En
}

/// Normalizes one provider item into a page record; items without markdown
/// are dropped.
pub fn normalize_crawl_item(item: &Value, crawl_id: &str) -> Option<PageRecord> {
    let markdown = item.get("markdown").and_then(Value::as_str)?;
    if markdown.is_empty() {
        return None;
    }

    let metadata = item.get("metadata").cloned().unwrap_or_default();
    let url = metadata
        .get("sourceURL")
        .or_else(|| metadata.get("url"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let title = metadata
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let metadata_language = metadata.get("language").and_then(Value::as_str);

    Some(PageRecord {
        language: language_from_url(&url, metadata_language),
        page_type: page_type_from_url(&url),
        url,
        title,
        markdown: markdown.to_string(),
        crawled_at: Utc::now(),
        crawl_job_id: crawl_id.to_string(),
    })
}

pub struct CrawlConfig {
    pub site_url: String,
    pub raw_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub scopes: Vec<CrawlScope>,
}

fn build_payload(site_url: &str, scope: &CrawlScope) -> Value {
    json!({
        "url": site_url,
        "includePaths": scope.include_paths,
        "excludePaths": scope.exclude_paths,
        "limit": scope.limit,
        "maxDiscoveryDepth": 4,
        "allowExternalLinks": false,
        "scrapeOptions": {
            "formats": ["markdown"],
            "onlyMainContent": true,
            "removeBase64Images": true,
        },
    })
}

/// Runs every configured scope, one shard per scope, and writes the crawl
/// manifest. Scopes whose shard already exists are left untouched.
pub async fn run_crawl(client: &CrawlClient, config: &CrawlConfig) -> Result<CrawlManifest, PipelineError> {
    std::fs::create_dir_all(&config.raw_dir)?;

    let mut outcomes = Vec::with_capacity(config.scopes.len());
    for scope in &config.scopes {
        let out_path = config.raw_dir.join(format!("{}.jsonl", scope.name));
        if shard_exists(&out_path) {
            info!(scope = %scope.name, "raw shard exists, skipping crawl");
            outcomes.push(CrawlScopeOutcome {
                name: scope.name.clone(),
                crawl_id: None,
                status: "skipped_existing".to_string(),
                completed: None,
                total: None,
                saved_rows: None,
                output_file: out_path.display().to_string(),
            });
            continue;
        }

        let payload = build_payload(&config.site_url, scope);
        let started = client.start_crawl(&payload).await?;
        let crawl_id = started
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::Crawl(format!("no crawl id returned for scope {}", scope.name))
            })?;

        let status = if is_terminal_status(&started) {
            started
        } else {
            client.poll_until_complete(&crawl_id).await?
        };

        let rows: Vec<PageRecord> = status
            .get("data")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| normalize_crawl_item(item, &crawl_id))
                    .collect()
            })
            .unwrap_or_default();
        write_shard(&out_path, &rows)?;
        info!(scope = %scope.name, rows = rows.len(), "raw shard written");

        outcomes.push(CrawlScopeOutcome {
            name: scope.name.clone(),
            crawl_id: Some(crawl_id),
            status: status
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            completed: status.get("completed").and_then(Value::as_u64),
            total: status.get("total").and_then(Value::as_u64),
            saved_rows: Some(rows.len()),
            output_file: out_path.display().to_string(),
        });
    }

    let manifest = CrawlManifest {
        generated_at: Utc::now(),
        scopes: outcomes,
    };
    write_manifest(&config.manifest_path, &manifest)?;
    Ok(manifest)
}

fn shard_exists(path: &Path) -> bool {
    path.metadata().map(|meta| meta.len() > 0).unwrap_or(false)
}
