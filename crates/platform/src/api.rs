//! REST client for the platform's query and RPC endpoints.
//!
//! Wraps the PostgREST-style HTTP API (`/rest/v1/<table>` selects and
//! `/rest/v1/rpc/<function>` calls) using [`reqwest`], and implements the
//! realtime layer's [`AggregationRpc`] and [`RoutingQuery`] ports on top.

use std::collections::BTreeSet;

use async_trait::async_trait;
use eryxon_core::types::{EntityId, TenantId};
use eryxon_realtime::ports::{AggregationRpc, RoutingQuery};
use eryxon_realtime::RealtimeError;
use serde_json::{json, Value};

use crate::config::PlatformConfig;

/// Columns of an operation row, with the owning cell and part embedded.
const OPERATION_SELECT: &str = "id,tenant_id,cell_id,part_id,sequence,status,estimated_time,\
actual_time,cell:cells(name,color,sequence),part:parts!inner(job_id)";

const CELL_SELECT: &str = "id,tenant_id,name,sequence,active,color";

pub struct PlatformApi {
    client: reqwest::Client,
    config: PlatformConfig,
}

/// Errors from the platform REST layer.
#[derive(Debug, thiserror::Error)]
pub enum PlatformApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The platform answered with a non-2xx status.
    #[error("Platform API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// A scalar RPC answered with an empty result set.
    #[error("RPC {0} returned no rows")]
    EmptyResult(String),
}

impl From<PlatformApiError> for RealtimeError {
    fn from(err: PlatformApiError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl PlatformApi {
    pub fn new(config: PlatformConfig) -> Result<Self, PlatformApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// Call a database function. Set-returning functions yield their first
    /// row.
    pub async fn rpc(&self, function: &str, args: &Value) -> Result<Value, PlatformApiError> {
        let response = self
            .client
            .post(self.config.rest_url(&format!("rpc/{function}")))
            .header("apikey", &self.config.api_key)
            .bearer_auth(self.config.bearer_token())
            .json(args)
            .send()
            .await?;

        let body: Value = Self::parse_response(response).await?;
        first_row(body).ok_or_else(|| PlatformApiError::EmptyResult(function.to_string()))
    }

    /// Select rows of `table` with PostgREST query parameters.
    pub async fn select(
        &self,
        table: &str,
        params: &[(&str, String)],
    ) -> Result<Value, PlatformApiError> {
        let response = self
            .client
            .get(self.config.rest_url(table))
            .header("apikey", &self.config.api_key)
            .bearer_auth(self.config.bearer_token())
            .query(params)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, PlatformApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(PlatformApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PlatformApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

fn first_row(body: Value) -> Option<Value> {
    match body {
        Value::Array(rows) => rows.into_iter().next(),
        Value::Null => None,
        other => Some(other),
    }
}

fn eq(id: impl std::fmt::Display) -> String {
    format!("eq.{id}")
}

fn in_list(ids: &BTreeSet<EntityId>) -> String {
    let list: Vec<String> = ids.iter().map(ToString::to_string).collect();
    format!("in.({})", list.join(","))
}

/// Query parameters selecting operation rows of a tenant, narrowed by
/// `scope` (`("part_id", ..)` or `("part.job_id", ..)`).
fn operation_params(tenant_id: TenantId, scope: (&'static str, String)) -> Vec<(&'static str, String)> {
    vec![
        ("select", OPERATION_SELECT.to_string()),
        ("tenant_id", eq(tenant_id)),
        scope,
        ("order", "sequence.asc".to_string()),
    ]
}

fn rpc_args(cell_id: EntityId, tenant_id: TenantId) -> Value {
    json!({"p_cell_id": cell_id, "p_tenant_id": tenant_id})
}

#[async_trait]
impl AggregationRpc for PlatformApi {
    async fn compute_cell_metrics(
        &self,
        cell_id: EntityId,
        tenant_id: TenantId,
    ) -> Result<Value, RealtimeError> {
        let function = &self.config.cell_metrics_rpc;
        Ok(self.rpc(function, &rpc_args(cell_id, tenant_id)).await?)
    }

    async fn compute_next_cell_capacity(
        &self,
        cell_id: EntityId,
        tenant_id: TenantId,
    ) -> Result<Value, RealtimeError> {
        let function = &self.config.capacity_rpc;
        Ok(self.rpc(function, &rpc_args(cell_id, tenant_id)).await?)
    }
}

#[async_trait]
impl RoutingQuery for PlatformApi {
    async fn cells(&self, tenant_id: TenantId) -> Result<Value, RealtimeError> {
        let params = [
            ("select", CELL_SELECT.to_string()),
            ("tenant_id", eq(tenant_id)),
            ("active", "eq.true".to_string()),
            ("order", "sequence.asc".to_string()),
        ];
        Ok(self.select("cells", &params).await?)
    }

    async fn part_operations(
        &self,
        tenant_id: TenantId,
        part_id: EntityId,
    ) -> Result<Value, RealtimeError> {
        let params = operation_params(tenant_id, ("part_id", eq(part_id)));
        Ok(self.select("operations", &params).await?)
    }

    async fn job_operations(
        &self,
        tenant_id: TenantId,
        job_id: EntityId,
    ) -> Result<Value, RealtimeError> {
        let params = operation_params(tenant_id, ("part.job_id", eq(job_id)));
        Ok(self.select("operations", &params).await?)
    }

    async fn jobs_operations(
        &self,
        tenant_id: TenantId,
        job_ids: &BTreeSet<EntityId>,
    ) -> Result<Value, RealtimeError> {
        let params = operation_params(tenant_id, ("part.job_id", in_list(job_ids)));
        Ok(self.select("operations", &params).await?)
    }
}
