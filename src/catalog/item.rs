use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw upload fields as parsed by the ingestion boundary. Keys are whatever
/// the source file carried; the pipeline never assumes a fixed schema.
pub type RawFields = Map<String, Value>;

const NAME_FIELDS: [&str; 4] = ["name", "product_name", "title", "item_name"];
const DESCRIPTION_FIELDS: [&str; 3] = ["description", "item_description", "product_description"];
const SKU_FIELDS: [&str; 5] = ["sku", "item_sku", "product_sku", "model", "part_number"];
const MAX_DESCRIPTION_TERM_CHARS: usize = 100;
// carry no product identity and would only pollute a concatenated term
const NON_DESCRIPTIVE_FIELDS: [&str; 5] = ["id", "price", "quantity", "currency", "unit"];
const MAX_FALLBACK_TERM_FIELDS: usize = 3;

/// Catalog-level enrichment status, aggregated from per-batch results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogStatus {
    Uploaded,
    Processing,
    Completed,
    PartiallyCompleted,
    Error,
}

impl CatalogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Error => "error",
        }
    }

    /// Terminal statuses never transition again; waiters can stop polling.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyCompleted | Self::Error
        )
    }
}

impl std::fmt::Display for CatalogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-item enrichment status persisted alongside the item record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line item as handed over by the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub item_id: String,
    pub raw_fields: RawFields,
}

impl LineItem {
    pub fn new(item_id: impl Into<String>, raw_fields: RawFields) -> Self {
        Self {
            item_id: item_id.into(),
            raw_fields,
        }
    }

    fn field_str(&self, key: &str) -> Option<&str> {
        self.raw_fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Derives the term used to query a vendor: name-like fields first, then
    /// a truncated description, then SKU-like fields, then a concatenation of
    /// the remaining descriptive fields. An item with nothing usable yields
    /// `None` and fails enrichment with a permanent error.
    pub fn search_term(&self) -> Option<String> {
        for key in NAME_FIELDS {
            if let Some(value) = self.field_str(key) {
                return Some(value.to_string());
            }
        }

        for key in DESCRIPTION_FIELDS {
            if let Some(value) = self.field_str(key) {
                let truncated: String = value.chars().take(MAX_DESCRIPTION_TERM_CHARS).collect();
                return Some(truncated);
            }
        }

        for key in SKU_FIELDS {
            if let Some(value) = self.field_str(key) {
                return Some(value.to_string());
            }
        }

        let fragments: Vec<String> = self
            .raw_fields
            .iter()
            .filter(|(key, _)| !NON_DESCRIPTIVE_FIELDS.contains(&key.as_str()))
            .filter_map(|(_, value)| fallback_fragment(value))
            .take(MAX_FALLBACK_TERM_FIELDS)
            .collect();
        if fragments.is_empty() {
            None
        } else {
            Some(fragments.join(" "))
        }
    }
}

/// String and numeric fields read as term fragments; structured values are
/// noise, not identity.
fn fallback_fragment(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Vendor-normalized attributes for a successfully enriched item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedFields {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub price: Option<f64>,
    pub currency: String,
    pub rating: Option<f64>,
    pub review_count: Option<u64>,
    pub availability: Option<String>,
    pub vendor_item_id: Option<String>,
    pub main_image: Option<String>,
    pub images: Vec<String>,
    pub source: String,
    pub enriched_at: DateTime<Utc>,
}

impl EnrichedFields {
    /// Empty skeleton tagged with the producing vendor.
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            name: None,
            description: None,
            category: None,
            brand: None,
            price: None,
            currency: "USD".to_string(),
            rating: None,
            review_count: None,
            availability: None,
            vendor_item_id: None,
            main_image: None,
            images: Vec::new(),
            source: source.into(),
            enriched_at: Utc::now(),
        }
    }
}

/// A user-owned catalog ready for enrichment. Items arrive already parsed and
/// validated; file-format handling happens upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub catalog_id: String,
    pub user_id: String,
    pub items: Vec<LineItem>,
    pub status: CatalogStatus,
}

impl Catalog {
    pub fn new(
        catalog_id: impl Into<String>,
        user_id: impl Into<String>,
        items: Vec<LineItem>,
    ) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            user_id: user_id.into(),
            items,
            status: CatalogStatus::Uploaded,
        }
    }
}
