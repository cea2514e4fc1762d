use std::time::Duration;

use microman_core::BROADCAST_ALL;
use microman_worker::{HandlerContext, HandlerResult};

pub async fn echo(ctx: HandlerContext) -> HandlerResult {
    ctx.reply("echo", ctx.payload().clone()).await
}

pub async fn echo_get(ctx: HandlerContext) -> HandlerResult {
    ctx.reply("echo.get", ctx.payload().clone()).await
}

/// Echo to every connected socket
pub async fn echo_all(ctx: HandlerContext) -> HandlerResult {
    ctx.broadcast(BROADCAST_ALL, "echo:all", ctx.payload().clone())
        .await
}

/// Echo after `delay`; used to exercise client timeouts
pub async fn echo_slow(ctx: HandlerContext, delay: Duration) -> HandlerResult {
    tokio::time::sleep(delay).await;
    ctx.reply("echo", ctx.payload().clone()).await
}
