use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::MuxError;
use crate::registry::{MuxRegistry, StreamDeps};
use crate::sink::streaming_response;

#[derive(Debug, Deserialize)]
pub struct QuotesParams {
    pub symbols: String,
}

/// `GET /stream/quotes?symbols=MSFT,AAPL`
#[tracing::instrument(skip(registry))]
pub async fn stream_quotes(
    State(registry): State<Arc<MuxRegistry>>,
    auth_user: AuthUser,
    Query(params): Query<QuotesParams>,
) -> Result<Response, MuxError> {
    let symbols: Vec<String> = params
        .symbols
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(MuxError::BadRequest("symbols must not be empty".into()));
    }

    let deps = StreamDeps::Quotes { symbols };
    let handle = registry
        .quotes
        .add_subscriber(&auth_user.user_id, &deps)
        .await?;
    Ok(streaming_response(handle))
}
