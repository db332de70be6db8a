use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::MuxError;
use crate::registry::{MuxRegistry, StreamDeps};
use crate::sink::streaming_response;

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    #[serde(default, rename = "paperTrading")]
    pub paper_trading: bool,
}

/// `GET /stream/orders/{account_id}?paperTrading=true`
#[tracing::instrument(skip(registry))]
pub async fn stream_orders(
    State(registry): State<Arc<MuxRegistry>>,
    auth_user: AuthUser,
    Path(account_id): Path<String>,
    Query(params): Query<OrdersQuery>,
) -> Result<Response, MuxError> {
    if account_id.trim().is_empty() {
        return Err(MuxError::BadRequest("account_id must not be empty".into()));
    }

    let deps = StreamDeps::Orders {
        account_id,
        paper_trading: params.paper_trading,
    };
    let handle = registry
        .orders
        .add_subscriber(&auth_user.user_id, &deps)
        .await?;
    Ok(streaming_response(handle))
}
