use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::MuxError;
use crate::registry::{MuxRegistry, StreamDeps};
use crate::sink::streaming_response;

fn default_interval() -> u32 {
    1
}
fn default_unit() -> String {
    "Minute".to_string()
}
fn default_barsback() -> u32 {
    1
}
fn default_session_template() -> String {
    "Default".to_string()
}

#[derive(Debug, Deserialize)]
pub struct BarsParams {
    pub ticker: String,
    #[serde(default = "default_interval")]
    pub interval: u32,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default = "default_barsback")]
    pub barsback: u32,
    #[serde(default = "default_session_template", rename = "sessionTemplate")]
    pub session_template: String,
}

/// `GET /stream/bars?ticker=MSFT&interval=1&unit=Minute&barsback=1&sessionTemplate=Default`
///
/// Exclusive per user: switching ticker/interval evicts the previous
/// subscription (spec.md's Glossary and scenario S3).
#[tracing::instrument(skip(registry))]
pub async fn stream_bars(
    State(registry): State<Arc<MuxRegistry>>,
    auth_user: AuthUser,
    Query(params): Query<BarsParams>,
) -> Result<Response, MuxError> {
    if params.ticker.trim().is_empty() {
        return Err(MuxError::BadRequest("ticker must not be empty".into()));
    }

    let deps = StreamDeps::Bars {
        ticker: params.ticker.trim().to_uppercase(),
        interval: params.interval,
        unit: params.unit,
        barsback: params.barsback,
        session_template: params.session_template,
    };
    let handle = registry
        .bars
        .add_exclusive_subscriber(&auth_user.user_id, &deps)
        .await?;
    Ok(streaming_response(handle))
}
