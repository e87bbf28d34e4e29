//! Columnar query layer: translate ephemeral query resources into SQL,
//! execute against ClickHouse, decode rows, and paginate.

pub mod builder;
pub mod client;
pub mod cursor;
pub mod filter;
pub mod scope;
pub mod time;

pub use builder::{build_facet_query, build_record_query, SurfaceSpec};
pub use client::{ClickHouseConfig, QueryClient};
pub use cursor::{Cursor, CursorError};
pub use filter::{FieldSchema, FieldType, FilterError, FilterExpr};
pub use scope::scope_predicate;
pub use time::{resolve_window, EffectiveWindow, Surface, TimeParseError};

use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::time::timeout;

/// Max facets per request and the per-facet concurrency cap.
pub const MAX_FACETS_PER_REQUEST: usize = 10;
pub const FACET_TIMEOUT: Duration = Duration::from_secs(30);
pub const FACET_TOTAL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("too many facets requested: {0} (max {MAX_FACETS_PER_REQUEST})")]
    TooManyFacets(usize),
    #[error("facet '{0}' timed out")]
    FacetTimeout(String),
    #[error(transparent)]
    Time(#[from] TimeParseError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Cursor(#[from] CursorError),
    #[error("backend query failed: {0}")]
    Backend(String),
}

/// Run up to `MAX_FACETS_PER_REQUEST` facet futures concurrently. Any single
/// facet failure (including timeout) fails the whole request; partial
/// success is not supported.
pub async fn run_facets_bounded<F, Fut, T>(names: &[String], run_one: F) -> Result<Vec<T>, QueryError>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<T, QueryError>>,
{
    if names.len() > MAX_FACETS_PER_REQUEST {
        return Err(QueryError::TooManyFacets(names.len()));
    }

    let total = timeout(FACET_TOTAL_TIMEOUT, async {
        let mut futs: FuturesUnordered<_> = names
            .iter()
            .cloned()
            .map(|name| {
                let fut = run_one(name.clone());
                async move {
                    match timeout(FACET_TIMEOUT, fut).await {
                        Ok(r) => r,
                        Err(_) => Err(QueryError::FacetTimeout(name)),
                    }
                }
            })
            .collect();

        let mut results = Vec::with_capacity(names.len());
        while let Some(r) = futs.next().await {
            results.push(r?);
        }
        Ok(results)
    })
    .await;

    match total {
        Ok(inner) => inner,
        Err(_) => Err(QueryError::FacetTimeout("total".into())),
    }
}
