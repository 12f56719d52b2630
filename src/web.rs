//! HTTP API.
//!
//! Thin translation layer: routes, parameter defaults, and the mapping from
//! gateway errors to status codes. All broker interaction goes through the
//! shared [`Session`] behind a read/write lock; only `/reconnect` ever takes
//! the write side, so data requests never serialize behind each other here.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use ibgate_tws::Contract;

use crate::error::GatewayError;
use crate::models::{
    ContractDetailsResponse, ErrorBody, HealthResponse, MarketDataResponse, ProductInfo,
    ProductsResponse, ReconnectResponse,
};
use crate::products;
use crate::resolver::{self, HistoryOutcome};
use crate::session::{self, GatewayConfig, Session};

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state.
pub struct Gateway {
    config: GatewayConfig,
    session: tokio::sync::RwLock<Option<Arc<Session>>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, session: Option<Session>) -> Self {
        Self {
            config,
            session: tokio::sync::RwLock::new(session.map(Arc::new)),
        }
    }

    /// Snapshot the current session if it is ready to serve requests.
    async fn ready_session(&self) -> Option<Arc<Session>> {
        let guard = self.session.read().await;
        guard.as_ref().filter(|s| s.is_ready()).cloned()
    }

    pub async fn shutdown(&self) {
        if let Some(session) = self.session.write().await.take() {
            session.disconnect().await;
        }
    }
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/reconnect", post(reconnect))
        .route("/products", get(list_products))
        .route("/market-data/{symbol}", get(market_data))
        .route("/contract-details/{symbol}", get(contract_details))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}

fn error_response(err: GatewayError, symbol: Option<&str>) -> Response {
    let status = match err {
        GatewayError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = match symbol {
        Some(sym) => ErrorBody::for_symbol(err.to_string(), sym),
        None => ErrorBody::new(err.to_string()),
    };
    (status, Json(body)).into_response()
}

fn not_found(message: String, symbol: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody::for_symbol(message, symbol)),
    )
        .into_response()
}

/// Live connectivity check. A ready session only proves the socket was up
/// at some point, so the probe opens a throwaway connection under its own
/// client id and reports what actually happened.
async fn health(State(gateway): State<Arc<Gateway>>) -> Response {
    let ready = gateway.ready_session().await.is_some();
    let report = session::test_connection(
        &gateway.config.ib_host,
        gateway.config.ib_port,
        HEALTH_PROBE_TIMEOUT,
    )
    .await;

    let status = if report.connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if report.connected {
            "healthy".to_string()
        } else {
            "unhealthy".to_string()
        },
        connected: report.connected,
        ready,
        host: gateway.config.ib_host.clone(),
        port: gateway.config.ib_port,
        client_id: gateway.config.ib_client_id,
        error: report.error,
        timestamp: Utc::now(),
    };
    (status, Json(body)).into_response()
}

/// Tear down the current session and establish a fresh one under the fixed
/// client id. The write lock holds off data requests for the duration.
async fn reconnect(State(gateway): State<Arc<Gateway>>) -> Response {
    let mut guard = gateway.session.write().await;
    if let Some(old) = guard.take() {
        old.disconnect().await;
    }

    match Session::connect(&gateway.config).await {
        Ok(session) => {
            *guard = Some(Arc::new(session));
            let body = ReconnectResponse {
                status: "reconnected".to_string(),
                message: format!(
                    "connected to {}:{}",
                    gateway.config.ib_host, gateway.config.ib_port
                ),
                client_id: gateway.config.ib_client_id,
                timestamp: Utc::now(),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "reconnect failed");
            error_response(e, None)
        }
    }
}

async fn list_products() -> Json<ProductsResponse> {
    let products: Vec<ProductInfo> = products::PRODUCTS.iter().map(ProductInfo::from).collect();
    Json(ProductsResponse {
        count: products.len(),
        products,
        timestamp: Utc::now(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketDataQuery {
    duration: Option<String>,
    bar_size: Option<String>,
    what_to_show: Option<String>,
}

async fn market_data(
    State(gateway): State<Arc<Gateway>>,
    Path(symbol): Path<String>,
    Query(query): Query<MarketDataQuery>,
) -> Response {
    let Some(session) = gateway.ready_session().await else {
        return error_response(GatewayError::NotReady, Some(&symbol));
    };

    let duration = query.duration.as_deref().unwrap_or("10 M");
    let bar_size = query.bar_size.as_deref().unwrap_or("1 day");
    let what_to_show = query.what_to_show.as_deref().unwrap_or("TRADES");

    let request_time = Utc::now();
    let outcome =
        match resolver::fetch_history(&session, &symbol, duration, bar_size, what_to_show).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(symbol, error = %e, "market data request failed");
                return error_response(e, Some(&symbol));
            }
        };
    let response_time = Utc::now();

    match outcome {
        HistoryOutcome::NoContract => {
            not_found(format!("no contract found for '{symbol}'"), &symbol)
        }
        HistoryOutcome::NoBars(details) => not_found(
            format!(
                "no historical data for '{}' ({})",
                symbol, details.contract.local_symbol
            ),
            &symbol,
        ),
        HistoryOutcome::Bars { details, bars } => {
            let data: Vec<_> = bars.iter().map(Into::into).collect();
            let body = MarketDataResponse {
                symbol: symbol.clone(),
                contract: details.as_ref().into(),
                duration: duration.to_string(),
                bar_size: bar_size.to_string(),
                what_to_show: what_to_show.to_string(),
                count: data.len(),
                data,
                request_time,
                response_time,
                duration_ms: (response_time - request_time).num_milliseconds(),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractQuery {
    code: Option<String>,
    sec_type: Option<String>,
    exchange: Option<String>,
    currency: Option<String>,
}

impl ContractQuery {
    /// Build the contract to resolve: the `code` parameter takes precedence
    /// over the path segment for the catalog lookup, and the remaining
    /// parameters override individual fields of the derived contract.
    fn contract_for(&self, path_code: &str) -> Contract {
        let code = self.code.as_deref().unwrap_or(path_code);
        let mut contract = products::contract_for_symbol(code);
        if let Some(sec_type) = &self.sec_type {
            contract.sec_type = sec_type.clone();
        }
        if let Some(exchange) = &self.exchange {
            contract.exchange = exchange.clone();
        }
        if let Some(currency) = &self.currency {
            contract.currency = currency.clone();
        }
        contract
    }
}

async fn contract_details(
    State(gateway): State<Arc<Gateway>>,
    Path(symbol): Path<String>,
    Query(query): Query<ContractQuery>,
) -> Response {
    let Some(session) = gateway.ready_session().await else {
        return error_response(GatewayError::NotReady, Some(&symbol));
    };

    let contract = query.contract_for(&symbol);

    let request_time = Utc::now();
    match resolver::resolve_contract(&session, &contract).await {
        Ok(contracts) if contracts.is_empty() => {
            not_found(format!("no contract found for '{symbol}'"), &symbol)
        }
        Ok(contracts) => {
            let response_time = Utc::now();
            let body = ContractDetailsResponse {
                symbol,
                count: contracts.len(),
                contracts,
                request_time,
                response_time,
                duration_ms: (response_time - request_time).num_milliseconds(),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            tracing::warn!(symbol, error = %e, "contract details request failed");
            error_response(e, Some(&symbol))
        }
    }
}
