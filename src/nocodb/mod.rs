use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::nocodb::model::{CountResponse, ListResponse};

pub mod model;

pub use model::{PageQuery, RowPage};

const NOCODB_API_BASE: &str = "https://app.nocodb.com/";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("table API returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unreadable response body for table {table}: {detail}")]
    Body { table: String, detail: String },
    #[error("unexpected response shape for table {table}: {detail}")]
    Structural { table: String, detail: String },
    #[error("pagination for table {table} exceeded {pages} pages")]
    PageCap { table: String, pages: u32 },
    #[error("invalid table API URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Shape errors and runaway pagination abort the run; everything else is
    /// treated as a transient remote failure. A body that is not JSON at all
    /// (proxy error pages, truncated replies) counts as transient.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Structural { .. } | FetchError::PageCap { .. })
    }
}

#[async_trait]
pub trait TableService: Send + Sync {
    async fn list_rows(&self, table: &str, query: &PageQuery) -> Result<RowPage, FetchError>;

    async fn count_rows(&self, table: &str, filter: Option<&str>) -> Result<u64, FetchError>;
}

#[derive(Clone)]
pub struct NocoClient {
    http: Client,
    base_url: Url,
    token: String,
    project_id: String,
}

impl fmt::Debug for NocoClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NocoClient")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

impl NocoClient {
    pub fn new(token: String, project_id: String, timeout: Duration) -> Result<Self, FetchError> {
        let base_url = parse_url(NOCODB_API_BASE)?;
        Self::with_base_url(token, project_id, base_url, timeout)
    }

    pub fn with_base_url(
        token: String,
        project_id: String,
        mut base_url: Url,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent("festival-sync/0.1")
            .timeout(timeout)
            .build()
            .map_err(|source| FetchError::Transport {
                url: base_url.to_string(),
                source,
            })?;
        Ok(Self {
            http,
            base_url,
            token,
            project_id,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, FetchError> {
        let base_url = parse_url(&cfg.nocodb.base_url)?;
        Self::with_base_url(
            cfg.nocodb.token.clone(),
            cfg.nocodb.project_id.clone(),
            base_url,
            Duration::from_secs(cfg.nocodb.timeout_secs),
        )
    }

    fn table_url(&self, table: &str, suffix: Option<&str>) -> Result<Url, FetchError> {
        let mut path = format!("api/v1/db/data/noco/{}/{}", self.project_id, table);
        if let Some(suffix) = suffix {
            path.push('/');
            path.push_str(suffix);
        }
        self.base_url
            .join(&path)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", path, e)))
    }

    pub fn build_list_request(
        &self,
        table: &str,
        query: &PageQuery,
    ) -> Result<reqwest::Request, FetchError> {
        let url = self.table_url(table, None)?;
        let mut params = vec![
            ("offset", query.offset.to_string()),
            ("limit", query.limit.to_string()),
        ];
        if let Some(filter) = query.filter.as_deref().filter(|f| !f.is_empty()) {
            params.push(("where", filter.to_string()));
        }
        self.http
            .get(url.clone())
            .header("xc-token", &self.token)
            .header("Content-Type", "application/json")
            .query(&params)
            .build()
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })
    }

    pub fn build_count_request(
        &self,
        table: &str,
        filter: Option<&str>,
    ) -> Result<reqwest::Request, FetchError> {
        let url = self.table_url(table, Some("count"))?;
        let mut builder = self.http.get(url.clone()).header("xc-token", &self.token);
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            builder = builder.query(&[("where", filter)]);
        }
        builder
            .build()
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })
    }

    async fn execute(&self, request: reqwest::Request) -> Result<String, FetchError> {
        let url = request.url().to_string();
        debug!(url = %url, "table API request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|source| FetchError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, url = %url, "table API error");
            return Err(FetchError::Status { status, body });
        }

        res.text()
            .await
            .map_err(|source| FetchError::Transport { url, source })
    }
}

fn parse_url(raw: &str) -> Result<Url, FetchError> {
    Url::parse(raw).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", raw, e)))
}

/// Turn a list response body into a page, rejecting anything without a row array.
pub(crate) fn parse_list_body(table: &str, body: &str) -> Result<RowPage, FetchError> {
    let payload: ListResponse = serde_json::from_str(body).map_err(|e| {
        if e.is_data() {
            FetchError::Structural {
                table: table.to_string(),
                detail: e.to_string(),
            }
        } else {
            FetchError::Body {
                table: table.to_string(),
                detail: format!("invalid JSON: {}", e),
            }
        }
    })?;
    let rows = match payload.list {
        Some(serde_json::Value::Array(rows)) => rows,
        Some(other) => {
            return Err(FetchError::Structural {
                table: table.to_string(),
                detail: format!("`list` is not an array (got {})", json_kind(&other)),
            })
        }
        None => {
            return Err(FetchError::Structural {
                table: table.to_string(),
                detail: "missing `list`".into(),
            })
        }
    };
    let (total_rows, is_last_page) = payload
        .page_info
        .map(|p| (p.total_rows, p.is_last_page))
        .unwrap_or((None, None));
    Ok(RowPage {
        rows,
        total_rows,
        is_last_page,
    })
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[async_trait]
impl TableService for NocoClient {
    async fn list_rows(&self, table: &str, query: &PageQuery) -> Result<RowPage, FetchError> {
        let request = self.build_list_request(table, query)?;
        let body = self.execute(request).await?;
        parse_list_body(table, &body)
    }

    async fn count_rows(&self, table: &str, filter: Option<&str>) -> Result<u64, FetchError> {
        let request = self.build_count_request(table, filter)?;
        let body = self.execute(request).await?;
        let payload: CountResponse =
            serde_json::from_str(&body).map_err(|e| FetchError::Body {
                table: table.to_string(),
                detail: format!("invalid count response: {}", e),
            })?;
        Ok(payload.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> NocoClient {
        NocoClient::with_base_url(
            "secret".into(),
            "proj".into(),
            Url::parse("https://noco.example/base").unwrap(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn build_list_request_sets_headers_and_query() {
        let query = PageQuery {
            offset: 100,
            limit: 50,
            filter: Some("(Statut,eq,Publié)".into()),
        };
        let request = client().build_list_request("tbl1", &query).unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/base/api/v1/db/data/noco/proj/tbl1");
        let pairs: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("offset".into(), "100".into())));
        assert!(pairs.contains(&("limit".into(), "50".into())));
        assert!(pairs.contains(&("where".into(), "(Statut,eq,Publié)".into())));
        assert_eq!(request.headers()["xc-token"], "secret");
    }

    #[test]
    fn build_list_request_omits_empty_filter() {
        let query = PageQuery {
            offset: 0,
            limit: 10,
            filter: Some(String::new()),
        };
        let request = client().build_list_request("tbl1", &query).unwrap();
        assert!(request.url().query_pairs().all(|(k, _)| k != "where"));
    }

    #[test]
    fn build_count_request_targets_count_endpoint() {
        let request = client().build_count_request("tbl9", None).unwrap();
        assert_eq!(request.url().path(), "/base/api/v1/db/data/noco/proj/tbl9/count");
        assert_eq!(request.url().query(), None);
        let filtered = client().build_count_request("tbl9", Some("(Statut,eq,Publié)")).unwrap();
        assert!(filtered.url().query_pairs().any(|(k, _)| k == "where"));
    }

    #[test]
    fn parse_list_body_reads_page_info() {
        let body = r#"{"list":[{"Id":1},{"Id":2}],"pageInfo":{"totalRows":7,"isLastPage":false}}"#;
        let page = parse_list_body("t", body).unwrap();
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.total_rows, Some(7));
        assert_eq!(page.is_last_page, Some(false));
    }

    #[test]
    fn parse_list_body_rejects_non_list() {
        let err = parse_list_body("t", r#"{"list":{"Id":1}}"#).unwrap_err();
        assert!(err.is_fatal());
        let err = parse_list_body("t", r#"{"rows":[]}"#).unwrap_err();
        assert!(matches!(err, FetchError::Structural { .. }));
    }

    #[test]
    fn non_json_body_is_transient() {
        let err = parse_list_body("t", "<html><body>502 Bad Gateway</body></html>").unwrap_err();
        assert!(matches!(err, FetchError::Body { .. }));
        assert!(!err.is_fatal());
        let err = parse_list_body("t", r#"{"list":[{"Id":1}"#).unwrap_err();
        assert!(!err.is_fatal());
        assert!(parse_list_body("t", r#"{"list":{}}"#).unwrap_err().is_fatal());
    }

    #[test]
    fn http_status_is_not_fatal() {
        let err = FetchError::Status {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(!err.is_fatal());
    }
}
