//! Paginated collection traversal.

use crate::client::Client;
use futures::stream::{self, Stream, TryStreamExt};
use rampart_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// Query parameters of one page request.
pub type PageParams = BTreeMap<String, String>;

/// How pages are addressed and where their items live.
pub trait PaginationStrategy: Send + Sync {
    /// Parameters of the first page request
    fn initial_params(&self) -> PageParams {
        PageParams::new()
    }

    /// Items contained in a decoded page body
    ///
    /// # Errors
    /// Returns a validation error if the body does not hold a list of items
    fn extract_items(&self, page: &Value) -> Result<Vec<Value>>;

    /// Parameters that replace `current` for the next page, or `None` after
    /// the last page
    fn next_params(&self, page: &Value, current: &PageParams) -> Option<PageParams>;
}

/// `?offset=N&limit=M` pagination.
///
/// Traversal stops at the first page holding fewer than `limit` items.
#[derive(Debug, Clone)]
pub struct OffsetLimitPagination {
    /// Name of the offset parameter
    pub offset_param: String,
    /// Name of the limit parameter
    pub limit_param: String,
    /// Page size
    pub limit: u64,
    /// Dotted path to the item list (`"data"`, `"result.items"`); `None`
    /// when the body is the list itself
    pub results_key: Option<String>,
}

impl Default for OffsetLimitPagination {
    fn default() -> Self {
        Self {
            offset_param: "offset".to_string(),
            limit_param: "limit".to_string(),
            limit: 100,
            results_key: Some("data".to_string()),
        }
    }
}

impl OffsetLimitPagination {
    /// Default parameter names with page size `limit`
    #[must_use]
    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Set the dotted path to the item list
    #[must_use]
    pub fn results_key(mut self, key: Option<&str>) -> Self {
        self.results_key = key.map(str::to_string);
        self
    }

    /// Set the parameter names
    #[must_use]
    pub fn params(mut self, offset: impl Into<String>, limit: impl Into<String>) -> Self {
        self.offset_param = offset.into();
        self.limit_param = limit.into();
        self
    }
}

impl PaginationStrategy for OffsetLimitPagination {
    fn initial_params(&self) -> PageParams {
        PageParams::from([(self.limit_param.clone(), self.limit.to_string())])
    }

    fn extract_items(&self, page: &Value) -> Result<Vec<Value>> {
        let mut current = page;
        if let Some(key) = &self.results_key {
            for segment in key.split('.') {
                match current.get(segment) {
                    Some(next) => current = next,
                    None => return Ok(Vec::new()),
                }
            }
        }
        match current {
            Value::Array(items) => Ok(items.clone()),
            Value::Null => Ok(Vec::new()),
            other => Err(Error::validation(format!(
                "expected a list of items, found {}",
                json_type(other)
            ))),
        }
    }

    fn next_params(&self, page: &Value, current: &PageParams) -> Option<PageParams> {
        let count = self.extract_items(page).ok()?.len() as u64;
        if count == 0 || count < self.limit {
            return None;
        }
        let offset = current
            .get(&self.offset_param)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        Some(PageParams::from([
            (self.offset_param.clone(), (offset + self.limit).to_string()),
            (self.limit_param.clone(), self.limit.to_string()),
        ]))
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Walks a paginated collection page by page.
///
/// Every page request goes through the full client pipeline, so pages are
/// retried, rate limited and cached like any other call.
pub struct Paginator<T> {
    client: Client,
    path: String,
    strategy: Box<dyn PaginationStrategy>,
    params: Option<PageParams>,
    pages: u32,
    _item: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Paginator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Paginator")
            .field("path", &self.path)
            .field("params", &self.params)
            .field("pages", &self.pages)
            .finish_non_exhaustive()
    }
}

impl<T: DeserializeOwned> Paginator<T> {
    pub(crate) fn new(client: Client, path: &str, strategy: Box<dyn PaginationStrategy>) -> Self {
        let params = strategy.initial_params();
        Self {
            client,
            path: path.to_string(),
            strategy,
            params: Some(params),
            pages: 0,
            _item: PhantomData,
        }
    }

    /// Add a query parameter sent with every page request
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        if let Some(params) = self.params.as_mut() {
            params.insert(key.into(), value.to_string());
        }
        self
    }

    /// Pages fetched so far
    #[must_use]
    pub fn pages_fetched(&self) -> u32 {
        self.pages
    }

    /// Fetch the next page. `Ok(None)` once the collection is exhausted.
    ///
    /// # Errors
    /// Returns the call error, or a validation error if the page or one of
    /// its items cannot be decoded. The paginator is exhausted afterwards.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>> {
        let Some(params) = self.params.take() else {
            return Ok(None);
        };

        let mut request = self.client.get(&self.path);
        for (key, value) in &params {
            request = request.query(key.clone(), value);
        }
        let page: Value = request.send_json().await?;
        let items = self.strategy.extract_items(&page)?;
        self.pages += 1;

        if let Some(next) = self.strategy.next_params(&page, &params) {
            let mut merged = params;
            merged.extend(next);
            self.params = Some(merged);
        }

        items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item)
                    .map_err(|e| Error::validation(format!("invalid page item: {e}")))
            })
            .collect::<Result<Vec<T>>>()
            .map(Some)
    }

    /// Fetch every remaining page and concatenate the items
    ///
    /// # Errors
    /// Returns the first page error
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }

    /// Stream the remaining items one by one
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        stream::try_unfold(self, |mut paginator| async move {
            let page = paginator.next_page().await?;
            Ok::<_, Error>(page.map(|page| (page, paginator)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<T, Error>)))
        .try_flatten()
    }
}
