//! Keepa REST adapter. Resolves a line item's search term to an ASIN through
//! the search endpoint, pulls the full product record, and normalizes title,
//! brand, category, price history, rating, and image data into the common
//! enriched shape.

use crate::catalog::item::{EnrichedFields, LineItem};
use crate::provider::adapter::{ItemEnricher, ProviderError};
use crate::provider::metrics::{ProviderMetrics, ProviderMetricsSnapshot};
use crate::provider::options::ProviderOptions;
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;

const VENDOR: &str = "keepa";
const KEEPA_PRODUCTION_URL: &str = "https://api.keepa.com";
/// Keepa marketplace id for amazon.com.
const KEEPA_DOMAIN_US: &str = "1";
const SEARCH_RESULT_LIMIT: &str = "5";
const IMAGE_CDN_PREFIX: &str = "https://m.media-amazon.com/images/I";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    products: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    asin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    #[serde(default)]
    products: Vec<ProductRecord>,
}

/// Subset of Keepa's product record the pipeline consumes. Unknown fields are
/// ignored so vendor-side additions do not break decoding.
#[derive(Debug, Deserialize)]
struct ProductRecord {
    title: Option<String>,
    brand: Option<String>,
    #[serde(default)]
    categories: Vec<Value>,
    /// Price series in cents; -1 marks intervals with no offer data.
    #[serde(default)]
    csv: Vec<Value>,
    rating: Option<f64>,
    #[serde(rename = "reviewCount")]
    review_count: Option<u64>,
    #[serde(rename = "imagesCSV")]
    images_csv: Option<String>,
}

/// HTTP client for the Keepa product-data API.
#[derive(Debug, Clone)]
pub struct KeepaProvider {
    client: reqwest::Client,
    api_key: Arc<String>,
    base_url: Arc<String>,
    metrics: Arc<ProviderMetrics>,
}

impl KeepaProvider {
    pub fn new(api_key: impl Into<String>, options: ProviderOptions) -> Result<Self> {
        options.validate()?;

        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            bail!("keepa api key must not be empty");
        }

        let base_url = options
            .base_url
            .as_deref()
            .unwrap_or(KEEPA_PRODUCTION_URL)
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .connect_timeout(options.connect_timeout)
            .user_agent(&options.user_agent)
            .build()
            .context("failed to build keepa http client")?;

        Ok(Self {
            client,
            api_key: Arc::new(api_key),
            base_url: Arc::new(base_url),
            metrics: Arc::new(ProviderMetrics::default()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    pub fn metrics(&self) -> ProviderMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => ProviderError::Auth { vendor: VENDOR },
                429 => ProviderError::RateLimited { vendor: VENDOR },
                code => ProviderError::Upstream {
                    vendor: VENDOR,
                    status: code,
                },
            });
        }

        response.json::<T>().await.map_err(|err| {
            if err.is_timeout() {
                ProviderError::Timeout { vendor: VENDOR }
            } else {
                ProviderError::Malformed {
                    vendor: VENDOR,
                    message: err.to_string(),
                }
            }
        })
    }

    /// Search then product lookup. The first search hit carrying an ASIN wins;
    /// an empty result set is a permanent no-match for the item.
    async fn lookup(&self, term: &str) -> Result<EnrichedFields, ProviderError> {
        let search: SearchResponse = self
            .get_json(
                "/search",
                &[
                    ("key", self.api_key.as_str()),
                    ("q", term),
                    ("domain", KEEPA_DOMAIN_US),
                    ("limit", SEARCH_RESULT_LIMIT),
                ],
            )
            .await?;

        if search.products.is_empty() {
            return Err(ProviderError::NoMatch {
                term: term.to_string(),
            });
        }

        let asin = search
            .products
            .into_iter()
            .find_map(|hit| hit.asin.filter(|asin| !asin.trim().is_empty()))
            .ok_or_else(|| ProviderError::Malformed {
                vendor: VENDOR,
                message: "search hits carried no asin".to_string(),
            })?;

        let mut lookup: ProductResponse = self
            .get_json(
                "/product",
                &[
                    ("key", self.api_key.as_str()),
                    ("asin", asin.as_str()),
                    ("domain", KEEPA_DOMAIN_US),
                    ("rating", "1"),
                    ("review", "1"),
                    ("images", "1"),
                ],
            )
            .await?;

        if lookup.products.is_empty() {
            return Err(ProviderError::Malformed {
                vendor: VENDOR,
                message: format!("product lookup for {asin} returned no records"),
            });
        }

        Ok(normalize(lookup.products.remove(0), asin))
    }
}

impl ItemEnricher for KeepaProvider {
    fn vendor(&self) -> &'static str {
        VENDOR
    }

    fn enrich_item<'a>(&'a self, item: &'a LineItem) -> BoxFuture<'a, Result<EnrichedFields>> {
        Box::pin(async move {
            let term = item
                .search_term()
                .ok_or_else(|| ProviderError::MissingSearchTerm {
                    item_id: item.item_id.clone(),
                })?;

            let started = Instant::now();
            match self.lookup(&term).await {
                Ok(fields) => {
                    self.metrics.record_success(started.elapsed());
                    tracing::debug!(item = %item.item_id, term = %term, "keepa lookup succeeded");
                    Ok(fields)
                }
                Err(err) => {
                    if matches!(err, ProviderError::Timeout { .. }) {
                        self.metrics.record_timeout(started.elapsed());
                    } else {
                        self.metrics.record_failure(started.elapsed());
                    }
                    tracing::debug!(item = %item.item_id, error = %err, "keepa lookup failed");
                    Err(err.into())
                }
            }
        })
    }
}

fn normalize(record: ProductRecord, asin: String) -> EnrichedFields {
    let mut fields = EnrichedFields::from_source(VENDOR);
    fields.name = record.title.filter(|title| !title.trim().is_empty());
    fields.brand = record.brand.filter(|brand| !brand.trim().is_empty());
    fields.category = record.categories.first().and_then(category_label);
    fields.price = latest_price(&record.csv);
    fields.rating = record.rating;
    fields.review_count = record.review_count;
    fields.images = image_urls(record.images_csv.as_deref());
    fields.main_image = fields.images.first().cloned();
    fields.vendor_item_id = Some(asin);
    fields
}

/// Categories arrive as names or numeric tree-node ids depending on the
/// endpoint; both render as the label.
fn category_label(value: &Value) -> Option<String> {
    match value {
        Value::String(name) if !name.trim().is_empty() => Some(name.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Latest usable entry of the price series, converted from cents to dollars.
fn latest_price(series: &[Value]) -> Option<f64> {
    series
        .iter()
        .rev()
        .filter_map(Value::as_f64)
        .find(|cents| *cents > 0.0)
        .map(|cents| cents / 100.0)
}

fn image_urls(images_csv: Option<&str>) -> Vec<String> {
    let Some(csv) = images_csv else {
        return Vec::new();
    };
    csv.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| format!("{IMAGE_CDN_PREFIX}/{id}.jpg"))
        .collect()
}

fn request_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout { vendor: VENDOR }
    } else {
        ProviderError::Transport {
            vendor: VENDOR,
            message: err.to_string(),
        }
    }
}
