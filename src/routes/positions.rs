use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::MuxError;
use crate::registry::{MuxRegistry, StreamDeps};
use crate::sink::streaming_response;

#[derive(Debug, Deserialize)]
pub struct PositionsQuery {
    #[serde(default, rename = "paperTrading")]
    pub paper_trading: bool,
}

/// `GET /stream/positions/{account_id}?paperTrading=true`
#[tracing::instrument(skip(registry))]
pub async fn stream_positions(
    State(registry): State<Arc<MuxRegistry>>,
    auth_user: AuthUser,
    Path(account_id): Path<String>,
    Query(params): Query<PositionsQuery>,
) -> Result<Response, MuxError> {
    if account_id.trim().is_empty() {
        return Err(MuxError::BadRequest("account_id must not be empty".into()));
    }

    let deps = StreamDeps::Positions {
        account_id,
        paper_trading: params.paper_trading,
    };
    let handle = registry
        .positions
        .add_subscriber(&auth_user.user_id, &deps)
        .await?;
    Ok(streaming_response(handle))
}
