use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::Database;
use crate::error::{GatewayError, Result};

/// A persisted mapping from (path, method) to a backend target URL.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Route {
    pub id: i32,
    pub path: String,
    pub target_url: String,
    pub method: String,
    pub enabled: bool,
    /// Advisory per-route cap, 0 = unlimited. Not enforced by the request
    /// path; only the global per-client limit is.
    pub rate_limit: i32,
    pub timeout_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload accepted by the create/update endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRoute {
    pub path: String,
    pub target_url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub rate_limit: i32,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i32,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> i32 {
    30
}

const ROUTE_COLUMNS: &str =
    "id, path, target_url, method, enabled, rate_limit, timeout_seconds, created_at, updated_at";

/// CRUD over route definitions.
#[derive(Clone)]
pub struct RouteRepository {
    db: Database,
}

impl RouteRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> Result<Vec<Route>> {
        sqlx::query_as::<_, Route>(&format!(
            "SELECT {} FROM routes ORDER BY id",
            ROUTE_COLUMNS
        ))
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| GatewayError::from_store(e, "route"))
    }

    pub async fn get(&self, id: i32) -> Result<Route> {
        sqlx::query_as::<_, Route>(&format!(
            "SELECT {} FROM routes WHERE id = $1",
            ROUTE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| GatewayError::from_store(e, "route"))?
        .ok_or_else(|| GatewayError::NotFound("route not found".into()))
    }

    /// Look up the enabled route matching an exact (path, method) pair.
    pub async fn find(&self, path: &str, method: &str) -> Result<Option<Route>> {
        sqlx::query_as::<_, Route>(&format!(
            "SELECT {} FROM routes WHERE path = $1 AND method = $2 AND enabled = true",
            ROUTE_COLUMNS
        ))
        .bind(path)
        .bind(method)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| GatewayError::from_store(e, "route"))
    }

    /// Look up a (path, method) pair regardless of the enabled flag. The
    /// request lifecycle uses this to tell "no route" (404) apart from
    /// "route disabled" (503); disabled routes are never forwarded to.
    pub async fn find_any(&self, path: &str, method: &str) -> Result<Option<Route>> {
        sqlx::query_as::<_, Route>(&format!(
            "SELECT {} FROM routes WHERE path = $1 AND method = $2",
            ROUTE_COLUMNS
        ))
        .bind(path)
        .bind(method)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| GatewayError::from_store(e, "route"))
    }

    /// Insert a route; id and timestamps are assigned by the database.
    pub async fn create(&self, route: &NewRoute) -> Result<Route> {
        sqlx::query_as::<_, Route>(&format!(
            "INSERT INTO routes (path, target_url, method, enabled, rate_limit, timeout_seconds) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            ROUTE_COLUMNS
        ))
        .bind(&route.path)
        .bind(&route.target_url)
        .bind(&route.method)
        .bind(route.enabled)
        .bind(route.rate_limit)
        .bind(route.timeout_seconds)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| GatewayError::from_store(e, "route"))
    }

    pub async fn update(&self, id: i32, route: &NewRoute) -> Result<Route> {
        sqlx::query_as::<_, Route>(&format!(
            "UPDATE routes SET path = $1, target_url = $2, method = $3, enabled = $4, \
             rate_limit = $5, timeout_seconds = $6, updated_at = NOW() \
             WHERE id = $7 RETURNING {}",
            ROUTE_COLUMNS
        ))
        .bind(&route.path)
        .bind(&route.target_url)
        .bind(&route.method)
        .bind(route.enabled)
        .bind(route.rate_limit)
        .bind(route.timeout_seconds)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| GatewayError::from_store(e, "route"))?
        .ok_or_else(|| GatewayError::NotFound("route not found".into()))
    }

    pub async fn delete(&self, id: i32) -> Result<()> {
        let result = sqlx::query("DELETE FROM routes WHERE id = $1")
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| GatewayError::from_store(e, "route"))?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound("route not found".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_route_defaults() {
        let route: NewRoute =
            serde_json::from_str(r#"{"path": "/api/users", "target_url": "http://b/u"}"#).unwrap();
        assert_eq!(route.method, "GET");
        assert!(route.enabled);
        assert_eq!(route.rate_limit, 0);
        assert_eq!(route.timeout_seconds, 30);
    }

    #[test]
    fn new_route_explicit_fields() {
        let route: NewRoute = serde_json::from_str(
            r#"{"path": "/p", "target_url": "http://b", "method": "POST",
                "enabled": false, "rate_limit": 50, "timeout_seconds": 5}"#,
        )
        .unwrap();
        assert_eq!(route.method, "POST");
        assert!(!route.enabled);
        assert_eq!(route.rate_limit, 50);
        assert_eq!(route.timeout_seconds, 5);
    }
}
