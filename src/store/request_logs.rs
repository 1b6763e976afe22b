use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use super::Database;
use crate::error::{GatewayError, Result};

/// Append-only record of a request that reached the lifecycle handler.
/// `route_id` is null when no route matched.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RequestLog {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i32>,
    pub route_id: Option<i32>,
    pub method: String,
    pub path: String,
    pub status_code: i32,
    pub response_time_ms: i32,
    pub client_ip: String,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl RequestLog {
    pub fn new(
        route_id: Option<i32>,
        method: impl Into<String>,
        path: impl Into<String>,
        status_code: u16,
        response_time_ms: u128,
        client_ip: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            route_id,
            method: method.into(),
            path: path.into(),
            status_code: i32::from(status_code),
            response_time_ms: response_time_ms.min(i32::MAX as u128) as i32,
            client_ip: client_ip.into(),
            user_agent: user_agent.into(),
            created_at: None,
        }
    }
}

/// Append-only access-log persistence.
#[derive(Clone)]
pub struct RequestLogRepository {
    db: Database,
}

impl RequestLogRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn append(&self, record: &RequestLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO request_logs \
             (route_id, method, path, status_code, response_time_ms, client_ip, user_agent) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.route_id)
        .bind(&record.method)
        .bind(&record.path)
        .bind(record.status_code)
        .bind(record.response_time_ms)
        .bind(&record.client_ip)
        .bind(&record.user_agent)
        .execute(self.db.pool())
        .await
        .map_err(|e| GatewayError::from_store(e, "request log"))?;
        Ok(())
    }

    /// Most recent log rows for one route.
    pub async fn for_route(&self, route_id: i32, limit: i64) -> Result<Vec<RequestLog>> {
        sqlx::query_as::<_, RequestLog>(
            "SELECT id, route_id, method, path, status_code, response_time_ms, \
             client_ip, user_agent, created_at \
             FROM request_logs WHERE route_id = $1 \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(route_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| GatewayError::from_store(e, "request log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_construction_clamps_response_time() {
        let record = RequestLog::new(Some(7), "GET", "/api/users", 200, u128::MAX, "1.2.3.4", "ua");
        assert_eq!(record.route_id, Some(7));
        assert_eq!(record.status_code, 200);
        assert_eq!(record.response_time_ms, i32::MAX);
        assert!(record.id.is_none());
    }

    #[test]
    fn unmatched_request_has_null_route() {
        let record = RequestLog::new(None, "POST", "/missing", 404, 3, "1.2.3.4", "ua");
        assert_eq!(record.route_id, None);
        assert_eq!(record.status_code, 404);
    }
}
