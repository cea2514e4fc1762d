use chrono::{DateTime, Utc};
use microman_worker::{HandlerContext, HandlerResult};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::validate_len;

#[derive(Debug, Deserialize)]
struct CreateTodo {
    title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub title: String,
    pub user_id: String,
    pub created: DateTime<Utc>,
}

/// Create a todo and broadcast it to every socket of the same user
pub async fn create(ctx: HandlerContext) -> HandlerResult {
    let session = ctx.require_session()?;
    let request: CreateTodo = ctx.payload_as()?;
    let title = validate_len("title", request.title.trim(), 2, 255)?;

    let todo = Todo {
        title: title.to_string(),
        user_id: session.user_id.clone(),
        created: Utc::now(),
    };
    ctx.broadcast(session.user_id.clone(), "todo:create", json!({ "todo": todo }))
        .await
}
