use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::{MessageContext, TransitionContext};
use crate::error::EngineResult;
use crate::handler::{EnterHandler, ExitHandler, MessageHandler};
use crate::key::StateKey;
use crate::message::{Message, MessageResult};

/// An interceptor in a node's filter chain. Each hook defaults to calling
/// straight through to `next`; override only the hooks a given filter cares
/// about. A filter may short-circuit by simply not calling `next`.
#[async_trait]
pub trait Filter: Send + Sync + 'static {
    async fn on_enter<'a>(
        &'a self,
        ctx: &'a mut TransitionContext<'_>,
        node: &'a StateKey,
        next: EnterNext<'a>,
    ) -> EngineResult<()> {
        next.call(ctx).await
    }

    async fn on_exit<'a>(
        &'a self,
        ctx: &'a mut TransitionContext<'_>,
        node: &'a StateKey,
        next: ExitNext<'a>,
    ) -> EngineResult<()> {
        next.call(ctx).await
    }

    async fn on_message<'a>(
        &'a self,
        ctx: &'a mut MessageContext<'_>,
        node: &'a StateKey,
        msg: &'a Message,
        next: MessageNext<'a>,
    ) -> EngineResult<MessageResult> {
        next.call(ctx, msg).await
    }
}

macro_rules! next_type {
    ($name:ident, $handler:ident, $method:ident, ($($arg:ident: $arg_ty:ty),*) -> $ret:ty) => {
        /// Continuation for the remainder of a filter chain, terminated by the
        /// node's own handler.
        pub struct $name<'a> {
            filters: &'a [Arc<dyn Filter>],
            node: &'a StateKey,
            handler: Option<&'a (dyn $handler)>,
        }

        impl<'a> $name<'a> {
            pub(crate) fn new(filters: &'a [Arc<dyn Filter>], node: &'a StateKey, handler: Option<&'a (dyn $handler)>) -> Self {
                Self { filters, node, handler }
            }

            pub fn call(self, $($arg: $arg_ty),*) -> BoxFuture<'a, $ret> {
                Box::pin(async move {
                    match self.filters.split_first() {
                        Some((first, rest)) => {
                            first
                                .$method($($arg),*, self.node, $name::new(rest, self.node, self.handler))
                                .await
                        }
                        None => match self.handler {
                            Some(h) => h.$method($($arg),*).await,
                            None => Ok(Default::default()),
                        },
                    }
                })
            }
        }
    };
}

next_type!(EnterNext, EnterHandler, on_enter, (ctx: &'a mut TransitionContext<'_>) -> EngineResult<()>);
next_type!(ExitNext, ExitHandler, on_exit, (ctx: &'a mut TransitionContext<'_>) -> EngineResult<()>);

/// Continuation for the message-handler filter chain.
pub struct MessageNext<'a> {
    filters: &'a [Arc<dyn Filter>],
    node: &'a StateKey,
    handler: Option<&'a dyn MessageHandler>,
}

impl<'a> MessageNext<'a> {
    pub(crate) fn new(
        filters: &'a [Arc<dyn Filter>],
        node: &'a StateKey,
        handler: Option<&'a dyn MessageHandler>,
    ) -> Self {
        Self {
            filters,
            node,
            handler,
        }
    }

    pub fn call(self, ctx: &'a mut MessageContext<'_>, msg: &'a Message) -> BoxFuture<'a, EngineResult<MessageResult>> {
        Box::pin(async move {
            match self.filters.split_first() {
                Some((first, rest)) => {
                    first
                        .on_message(ctx, self.node, msg, MessageNext::new(rest, self.node, self.handler))
                        .await
                }
                None => match self.handler {
                    Some(h) => h.on_message(ctx, msg).await,
                    None => Ok(MessageResult::Unhandled),
                },
            }
        })
    }
}

/// Runs `node`'s `on_enter` handler through its filter chain.
pub async fn run_enter_chain(
    filters: &[Arc<dyn Filter>],
    node: &StateKey,
    handler: Option<&(dyn EnterHandler)>,
    ctx: &mut TransitionContext<'_>,
) -> EngineResult<()> {
    EnterNext::new(filters, node, handler).call(ctx).await
}

/// Runs `node`'s `on_exit` handler through its filter chain.
pub async fn run_exit_chain(
    filters: &[Arc<dyn Filter>],
    node: &StateKey,
    handler: Option<&(dyn ExitHandler)>,
    ctx: &mut TransitionContext<'_>,
) -> EngineResult<()> {
    ExitNext::new(filters, node, handler).call(ctx).await
}

/// Runs `node`'s `on_message` handler through its filter chain.
pub async fn run_message_chain(
    filters: &[Arc<dyn Filter>],
    node: &StateKey,
    handler: Option<&dyn MessageHandler>,
    ctx: &mut MessageContext<'_>,
    msg: &Message,
) -> EngineResult<MessageResult> {
    MessageNext::new(filters, node, handler).call(ctx, msg).await
}
