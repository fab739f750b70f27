//! Posture Collector
//!
//! Reads the three raw facts an audit needs from a project's catalog and
//! auth admin API. Read-only; nothing is cached here.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::{PostureError, ProjectConnection, Table, User};

/// Catalog function installed in the project that lists RLS state per table
pub const DEFAULT_RLS_STATUS_FUNCTION: &str = "get_tables_rls_status";

/// Users requested per admin API page
pub const DEFAULT_USERS_PAGE_SIZE: u32 = 1000;

/// Admin API pages read before a user listing is abandoned
pub const DEFAULT_MAX_USER_PAGES: u32 = 1000;

/// Source of raw posture facts for a project
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Row-level security flag for every inspected table
    async fn list_protection_status(
        &self,
        conn: &ProjectConnection,
    ) -> Result<Vec<Table>, PostureError>;

    /// Every account with its MFA enrollment
    async fn list_users(&self, conn: &ProjectConnection) -> Result<Vec<User>, PostureError>;

    /// Whether built-in authentication is active
    async fn auth_config(&self, conn: &ProjectConnection) -> Result<bool, PostureError>;
}

/// Collector for Supabase projects (PostgREST RPC + GoTrue admin API)
#[derive(Debug, Clone)]
pub struct SupabaseCollector {
    http_client: Client,
    rls_function: String,
    users_page_size: u32,
    max_user_pages: u32,
}

/// Row returned by the RLS status function
#[derive(Debug, Deserialize)]
struct RlsStatusRow {
    name: String,
    #[serde(alias = "hasRLS", alias = "has_protection")]
    has_rls: bool,
    #[serde(default)]
    policy_count: Option<i64>,
}

impl From<RlsStatusRow> for Table {
    fn from(row: RlsStatusRow) -> Self {
        Self {
            name: row.name,
            has_protection: row.has_rls,
            // Negative counts from a misbehaving function clamp to zero
            policy_count: row
                .policy_count
                .map(|c| c.clamp(0, i64::from(u32::MAX)) as u32),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AdminUsersPage {
    #[serde(default)]
    users: Vec<AdminUser>,
}

#[derive(Debug, Deserialize)]
struct AdminUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    factors: Option<Vec<AdminFactor>>,
}

#[derive(Debug, Deserialize)]
struct AdminFactor {
    #[serde(default)]
    status: String,
}

impl From<AdminUser> for User {
    fn from(user: AdminUser) -> Self {
        let has_mfa = user
            .factors
            .unwrap_or_default()
            .iter()
            .any(|f| f.status.eq_ignore_ascii_case("verified"));

        Self {
            id: user.id,
            email: user.email.unwrap_or_default(),
            has_mfa,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthSettings {
    #[serde(default)]
    external: HashMap<String, serde_json::Value>,
}

impl AuthSettings {
    fn any_provider_enabled(&self) -> bool {
        self.external.values().any(|v| v.as_bool() == Some(true))
    }
}

impl SupabaseCollector {
    pub fn new(timeout: Duration) -> Result<Self, PostureError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PostureError::Connectivity(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            rls_function: DEFAULT_RLS_STATUS_FUNCTION.to_string(),
            users_page_size: DEFAULT_USERS_PAGE_SIZE,
            max_user_pages: DEFAULT_MAX_USER_PAGES,
        })
    }

    /// Use a differently named catalog function
    pub fn with_rls_function(mut self, name: impl Into<String>) -> Self {
        self.rls_function = name.into();
        self
    }

    pub fn with_users_page_size(mut self, size: u32) -> Self {
        self.users_page_size = size.max(1);
        self
    }

    pub fn with_max_user_pages(mut self, pages: u32) -> Self {
        self.max_user_pages = pages.max(1);
        self
    }

    fn authorized(&self, builder: RequestBuilder, conn: &ProjectConnection) -> RequestBuilder {
        builder
            .header("apikey", conn.service_role_key())
            .bearer_auth(conn.service_role_key())
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        conn: &ProjectConnection,
        what: &str,
        response: Response,
    ) -> Result<T, PostureError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                project = %conn.project_ref(),
                status = %status,
                "{} request failed",
                what
            );
            return Err(classify_status(what, status, &body));
        }

        response.json::<T>().await.map_err(|e| {
            PostureError::Connectivity(format!("Unexpected {} response: {}", what, e))
        })
    }
}

/// Map an upstream status to the collector error taxonomy
fn classify_status(what: &str, status: StatusCode, body: &str) -> PostureError {
    let detail = format!("{} returned {}: {}", what, status, body);
    match status {
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => PostureError::Permission(detail),
        _ => PostureError::Connectivity(detail),
    }
}

#[async_trait]
impl CatalogSource for SupabaseCollector {
    async fn list_protection_status(
        &self,
        conn: &ProjectConnection,
    ) -> Result<Vec<Table>, PostureError> {
        let url = conn.endpoint(&format!("rest/v1/rpc/{}", self.rls_function));

        let response = self
            .authorized(self.http_client.post(&url), conn)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let rows: Vec<RlsStatusRow> = self.read_json(conn, "RLS status", response).await?;
        let tables: Vec<Table> = rows.into_iter().map(Table::from).collect();

        info!(project = %conn.project_ref(), count = tables.len(), "Listed table RLS status");
        Ok(tables)
    }

    async fn list_users(&self, conn: &ProjectConnection) -> Result<Vec<User>, PostureError> {
        let url = conn.endpoint("auth/v1/admin/users");
        let mut users = Vec::new();
        let mut seen = HashSet::new();
        let mut page: u32 = 1;

        loop {
            if page > self.max_user_pages {
                warn!(
                    project = %conn.project_ref(),
                    pages = self.max_user_pages,
                    "User listing did not end within the page limit"
                );
                return Err(PostureError::Connectivity(format!(
                    "Admin users listing exceeded {} pages",
                    self.max_user_pages
                )));
            }

            let response = self
                .authorized(self.http_client.get(&url), conn)
                .query(&[("page", page), ("per_page", self.users_page_size)])
                .send()
                .await?;

            let batch: AdminUsersPage = self.read_json(conn, "Admin users", response).await?;
            let fetched = batch.users.len();
            let before = users.len();
            users.extend(
                batch
                    .users
                    .into_iter()
                    .filter(|u| seen.insert(u.id.clone()))
                    .map(User::from),
            );
            let added = users.len() - before;

            debug!(project = %conn.project_ref(), page, fetched, added, "Fetched users page");

            if fetched < self.users_page_size as usize {
                break;
            }
            // A full page of known ids means the endpoint ignores paging
            if added == 0 {
                warn!(
                    project = %conn.project_ref(),
                    page,
                    "Admin users page repeated earlier results, stopping"
                );
                break;
            }
            page += 1;
        }

        info!(project = %conn.project_ref(), count = users.len(), "Listed users");
        Ok(users)
    }

    async fn auth_config(&self, conn: &ProjectConnection) -> Result<bool, PostureError> {
        let url = conn.endpoint("auth/v1/settings");

        let response = self
            .authorized(self.http_client.get(&url), conn)
            .send()
            .await?;

        let settings: AuthSettings = self.read_json(conn, "Auth settings", response).await?;
        Ok(settings.any_provider_enabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn collector() -> SupabaseCollector {
        SupabaseCollector::new(Duration::from_secs(5)).unwrap()
    }

    fn conn(server: &MockServer) -> ProjectConnection {
        ProjectConnection::new(&server.uri(), "service-key").unwrap()
    }

    #[tokio::test]
    async fn test_list_protection_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/get_tables_rls_status"))
            .and(header("apikey", "service-key"))
            .and(header("authorization", "Bearer service-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "profiles", "has_rls": true},
                {"name": "orders", "has_rls": false},
                {"name": "audit_log", "has_rls": true, "policy_count": -3}
            ])))
            .mount(&server)
            .await;

        let tables = collector()
            .list_protection_status(&conn(&server))
            .await
            .unwrap();

        assert_eq!(tables.len(), 3);
        assert_eq!(tables[0], Table::new("profiles", true));
        assert_eq!(tables[1], Table::new("orders", false));
        assert_eq!(tables[2].policy_count, Some(0));
    }

    #[tokio::test]
    async fn test_custom_function_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/rls_report"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let tables = collector()
            .with_rls_function("rls_report")
            .list_protection_status(&conn(&server))
            .await
            .unwrap();
        assert!(tables.is_empty());
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/get_tables_rls_status"))
            .respond_with(ResponseTemplate::new(404).set_body_string("function not found"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/settings"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid JWT"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/admin/users"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let c = collector();
        let conn = conn(&server);
        assert!(matches!(
            c.list_protection_status(&conn).await,
            Err(PostureError::Permission(_))
        ));
        assert!(matches!(
            c.auth_config(&conn).await,
            Err(PostureError::Connectivity(_))
        ));
        assert!(matches!(
            c.list_users(&conn).await,
            Err(PostureError::Permission(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_body_is_connectivity_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/get_tables_rls_status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let result = collector().list_protection_status(&conn(&server)).await;
        assert!(matches!(result, Err(PostureError::Connectivity(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connectivity_error() {
        let conn = ProjectConnection::new("http://127.0.0.1:9", "service-key").unwrap();
        let result = collector().auth_config(&conn).await;
        assert!(matches!(result, Err(PostureError::Connectivity(_))));
    }

    #[tokio::test]
    async fn test_list_users_paginates_and_reads_factors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/admin/users"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "users": [
                    {"id": "u1", "email": "a@example.com", "factors": [{"status": "verified"}]},
                    {"id": "u2", "email": "b@example.com", "factors": [{"status": "unverified"}]}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/admin/users"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "users": [
                    {"id": "u3", "phone": "+15550000", "factors": null}
                ]
            })))
            .mount(&server)
            .await;

        let users = collector()
            .with_users_page_size(2)
            .list_users(&conn(&server))
            .await
            .unwrap();

        assert_eq!(users.len(), 3);
        assert!(users[0].has_mfa);
        assert!(!users[1].has_mfa);
        assert!(!users[2].has_mfa);
        assert_eq!(users[2].email, "");
    }

    #[tokio::test]
    async fn test_list_users_stops_when_paging_is_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/admin/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "users": [
                    {"id": "u1", "email": "a@example.com"},
                    {"id": "u2", "email": "b@example.com"}
                ]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let users = collector()
            .with_users_page_size(2)
            .list_users(&conn(&server))
            .await
            .unwrap();

        let ids: Vec<&str> = users.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_list_users_gives_up_after_page_limit() {
        let server = MockServer::start().await;
        for page in 1..=3 {
            Mock::given(method("GET"))
                .and(path("/auth/v1/admin/users"))
                .and(query_param("page", page.to_string()))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "users": [{"id": format!("u{}", page)}]
                })))
                .mount(&server)
                .await;
        }

        let result = collector()
            .with_users_page_size(1)
            .with_max_user_pages(2)
            .list_users(&conn(&server))
            .await;

        assert!(matches!(result, Err(PostureError::Connectivity(_))));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_auth_config_reads_external_providers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/settings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "external": {"email": true, "phone": false, "github": false},
                "disable_signup": false
            })))
            .mount(&server)
            .await;

        assert!(collector().auth_config(&conn(&server)).await.unwrap());
    }

    #[tokio::test]
    async fn test_auth_config_all_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/settings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "external": {"email": false, "phone": false}
            })))
            .mount(&server)
            .await;

        assert!(!collector().auth_config(&conn(&server)).await.unwrap());
    }
}
