//! Per-type message validation.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{Middleware, Next};
use crate::bus::context::SignalBusContext;
use crate::error::Result;

/// Scratch key set to `true` when a message is rejected.
pub const VALIDATION_FAILED_KEY: &str = "validation_failed";

type Rule = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync>;

/// Rejects messages that fail the rule registered for their type.
///
/// A rejected publish is cancelled, flagged with [`VALIDATION_FAILED_KEY`]
/// and never reaches the rest of the chain. Types without a rule pass.
#[derive(Clone, Default)]
pub struct ValidationMiddleware {
    rules: HashMap<TypeId, Rule>,
}

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rule for messages of type `M`, replacing any earlier one.
    pub fn rule<M, F>(mut self, predicate: F) -> Self
    where
        M: Send + Sync + 'static,
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        let rule: Rule = Arc::new(move |message: &(dyn Any + Send + Sync)| {
            message.downcast_ref::<M>().is_some_and(|m| predicate(m))
        });
        self.rules.insert(TypeId::of::<M>(), rule);
        self
    }
}

impl Middleware for ValidationMiddleware {
    fn handle(&self, ctx: &mut SignalBusContext, next: &Next) -> Result<()> {
        let Some(rule) = self.rules.get(&ctx.message_type_id()) else {
            return next(ctx);
        };

        if rule(&**ctx.envelope()) {
            return next(ctx);
        }

        debug!(
            message_type = ctx.message_type(),
            correlation_id = ctx.correlation_id(),
            "Message rejected by validation"
        );
        ctx.insert_item(VALIDATION_FAILED_KEY, true);
        ctx.cancel();
        Ok(())
    }

    fn name(&self) -> &str {
        "validation"
    }
}
