//! Offset/limit pagination over a remote table.
use tracing::{debug, info, instrument};

use crate::config::TableConfig;
use crate::model::{EventKind, RawRecord};
use crate::nocodb::{FetchError, PageQuery, TableService};

/// Upper bound on pages requested for a single table.
pub const MAX_PAGES: u32 = 100;

/// A table to pull, with the name used for logs and snapshot files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub id: String,
    pub page_size: u32,
    pub filter: Option<String>,
}

impl TableSpec {
    pub fn for_kind(kind: EventKind, table: &TableConfig) -> Self {
        Self {
            name: kind.plural().to_string(),
            id: table.id.clone(),
            page_size: table.page_size,
            filter: Some(table.filter.clone()).filter(|f| !f.trim().is_empty()),
        }
    }
}

/// Fetch every row of `table`, in API order.
///
/// A page ends the fetch when the API flags it as last, when it is shorter
/// than the page size, or when the running total reaches the reported row
/// count. An empty page after the first is always the end. Any page failure
/// fails the whole table.
#[instrument(skip(service, table), fields(table = %table.name))]
pub async fn fetch_all<S>(service: &S, table: &TableSpec) -> Result<Vec<RawRecord>, FetchError>
where
    S: TableService + ?Sized,
{
    let limit = table.page_size.max(1);
    let mut rows: Vec<RawRecord> = Vec::new();
    let mut page: u32 = 0;

    loop {
        if page >= MAX_PAGES {
            return Err(FetchError::PageCap {
                table: table.name.clone(),
                pages: MAX_PAGES,
            });
        }

        let query = PageQuery {
            offset: u64::from(page) * u64::from(limit),
            limit,
            filter: table.filter.clone(),
        };
        let result = service.list_rows(&table.id, &query).await?;
        let received = result.rows.len();
        debug!(page, offset = query.offset, received, "page fetched");

        if received == 0 && page > 0 {
            debug!(page, "empty page, end of data");
            break;
        }

        rows.extend(result.rows);
        page += 1;

        let flagged_last = result.is_last_page == Some(true);
        let short_page = received < limit as usize;
        let reached_total = result
            .total_rows
            .map(|total| total > 0 && rows.len() as u64 >= total)
            .unwrap_or(false);
        if flagged_last || short_page || reached_total {
            break;
        }
    }

    info!(pages = page, rows = rows.len(), "table fetched");
    Ok(rows)
}
