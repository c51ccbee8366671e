use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::{MessageContext, TransitionContext};
use crate::error::EngineResult;
use crate::message::{Message, MessageResult};

/// Runs when a state is entered, after its [`DataValue`](crate::data::DataValue)
/// (if any) has been seeded. An `Err` becomes a `HandlerError`, surfaced as a
/// `FailedMessage` with no rollback of whatever already entered (§9 open
/// question 1).
#[async_trait]
pub trait EnterHandler: Send + Sync + 'static {
    async fn on_enter(&self, ctx: &mut TransitionContext<'_>) -> EngineResult<()>;
}

/// Runs when a state is exited, before its `DataValue` (if any) is closed.
#[async_trait]
pub trait ExitHandler: Send + Sync + 'static {
    async fn on_exit(&self, ctx: &mut TransitionContext<'_>) -> EngineResult<()>;
}

/// Runs when a message reaches this state during dispatch.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, ctx: &mut MessageContext<'_>, msg: &Message) -> EngineResult<MessageResult>;
}

/// Adapts a plain async closure into an [`EnterHandler`].
pub struct EnterFn<F>(pub F);

#[async_trait]
impl<F, Fut> EnterHandler for EnterFn<F>
where
    F: Fn(&mut TransitionContext<'_>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = EngineResult<()>> + Send,
{
    async fn on_enter(&self, ctx: &mut TransitionContext<'_>) -> EngineResult<()> {
        (self.0)(ctx).await
    }
}

/// Adapts a plain async closure into an [`ExitHandler`].
pub struct ExitFn<F>(pub F);

#[async_trait]
impl<F, Fut> ExitHandler for ExitFn<F>
where
    F: Fn(&mut TransitionContext<'_>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = EngineResult<()>> + Send,
{
    async fn on_exit(&self, ctx: &mut TransitionContext<'_>) -> EngineResult<()> {
        (self.0)(ctx).await
    }
}

/// Adapts a plain async closure into a [`MessageHandler`].
pub struct MessageFn<F>(pub F);

#[async_trait]
impl<F> MessageHandler for MessageFn<F>
where
    F: for<'a> Fn(&'a mut MessageContext<'_>, &'a Message) -> BoxFuture<'a, EngineResult<MessageResult>> + Send + Sync + 'static,
{
    async fn on_message(&self, ctx: &mut MessageContext<'_>, msg: &Message) -> EngineResult<MessageResult> {
        (self.0)(ctx, msg).await
    }
}
