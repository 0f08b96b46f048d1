use serde::Deserialize;
use serde_json::Value;

use crate::model::RawRecord;

/// One page of rows from a list call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPage {
    pub rows: Vec<RawRecord>,
    pub total_rows: Option<u64>,
    pub is_last_page: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub offset: u64,
    pub limit: u32,
    pub filter: Option<String>,
}

/// Wire shape of `GET /api/v1/db/data/noco/{project}/{table}`.
///
/// `list` stays a raw value so a non-array can be reported as a shape error
/// instead of a generic decode failure.
#[derive(Debug, Deserialize)]
pub(crate) struct ListResponse {
    #[serde(default)]
    pub list: Option<Value>,
    #[serde(rename = "pageInfo", default)]
    pub page_info: Option<PageInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PageInfo {
    #[serde(default)]
    pub total_rows: Option<u64>,
    #[serde(default)]
    pub is_last_page: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CountResponse {
    pub count: u64,
}
