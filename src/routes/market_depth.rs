use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::MuxError;
use crate::registry::{MuxRegistry, StreamDeps};
use crate::sink::streaming_response;

fn default_maxlevels() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct MarketDepthParams {
    pub ticker: String,
    #[serde(default = "default_maxlevels")]
    pub maxlevels: u32,
}

/// `GET /stream/market-depth?ticker=MSFT&maxlevels=50`
#[tracing::instrument(skip(registry))]
pub async fn stream_market_depth(
    State(registry): State<Arc<MuxRegistry>>,
    auth_user: AuthUser,
    Query(params): Query<MarketDepthParams>,
) -> Result<Response, MuxError> {
    if params.ticker.trim().is_empty() {
        return Err(MuxError::BadRequest("ticker must not be empty".into()));
    }

    let deps = StreamDeps::MarketDepth {
        ticker: params.ticker.trim().to_uppercase(),
        maxlevels: params.maxlevels,
    };
    let handle = registry
        .market_depth
        .add_subscriber(&auth_user.user_id, &deps)
        .await?;
    Ok(streaming_response(handle))
}
