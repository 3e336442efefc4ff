//! Routing of inbound requests and notifications to channels.
//!
//! Bindings are keyed by `(origin, scope)` and hold one entry per remote
//! context. An inbound message is routed by the sender's origin, the scope
//! prefix of its method and the sender's context; an exact origin binding
//! takes precedence over a wildcard one.

use crate::error::ChannelError;
use crate::transport::ContextId;
use std::collections::HashMap;

/// Origin that matches every sender.
pub const WILDCARD_ORIGIN: &str = "*";

#[derive(Debug)]
struct Binding<H> {
    context: ContextId,
    handler: H,
}

/// Process-wide table of channel bindings.
#[derive(Debug)]
pub struct ChannelRegistry<H> {
    /// origin -> scope -> bindings
    bindings: HashMap<String, HashMap<String, Vec<Binding<H>>>>,
}

impl<H> Default for ChannelRegistry<H> {
    fn default() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }
}

impl<H: Clone> ChannelRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding.
    ///
    /// Fails with `DuplicateBinding` if a binding on the same context and
    /// scope exists whose origin is equal to `origin`, or where either origin
    /// is the wildcard.
    pub fn register(
        &mut self,
        context: ContextId,
        origin: &str,
        scope: &str,
        handler: H,
    ) -> Result<(), ChannelError> {
        if self.overlaps(context, origin, scope) {
            return Err(ChannelError::DuplicateBinding {
                origin: origin.to_string(),
                scope: scope.to_string(),
            });
        }
        self.bindings
            .entry(origin.to_string())
            .or_default()
            .entry(scope.to_string())
            .or_default()
            .push(Binding { context, handler });
        Ok(())
    }

    fn overlaps(&self, context: ContextId, origin: &str, scope: &str) -> bool {
        let bound_here = |scopes: &HashMap<String, Vec<Binding<H>>>| {
            scopes
                .get(scope)
                .is_some_and(|list| list.iter().any(|b| b.context == context))
        };
        if origin == WILDCARD_ORIGIN {
            // A wildcard overlaps with every origin.
            self.bindings.values().any(bound_here)
        } else {
            [WILDCARD_ORIGIN, origin]
                .iter()
                .filter_map(|o| self.bindings.get(*o))
                .any(bound_here)
        }
    }

    /// Remove the binding for exactly this context, origin and scope.
    ///
    /// Empty buckets are pruned. Returns whether a binding was removed.
    pub fn unregister(&mut self, context: ContextId, origin: &str, scope: &str) -> bool {
        let Some(scopes) = self.bindings.get_mut(origin) else {
            return false;
        };
        let Some(list) = scopes.get_mut(scope) else {
            return false;
        };
        let before = list.len();
        list.retain(|b| b.context != context);
        let removed = list.len() != before;
        if list.is_empty() {
            scopes.remove(scope);
        }
        if scopes.is_empty() {
            self.bindings.remove(origin);
        }
        removed
    }

    /// Find the handler for a message from `context` at `origin` in `scope`.
    pub fn route(&self, context: ContextId, origin: &str, scope: &str) -> Option<H> {
        [origin, WILDCARD_ORIGIN].iter().find_map(|o| {
            self.bindings
                .get(*o)?
                .get(scope)?
                .iter()
                .find(|b| b.context == context)
                .map(|b| b.handler.clone())
        })
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        self.bindings
            .values()
            .flat_map(|scopes| scopes.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_then_exact_origin_conflicts() {
        let ctx = ContextId::new();
        let mut registry = ChannelRegistry::new();
        registry.register(ctx, "*", "a", 1).unwrap();
        let err = registry.register(ctx, "http://x.com", "a", 2).unwrap_err();
        assert!(matches!(err, ChannelError::DuplicateBinding { .. }));
    }

    #[test]
    fn test_exact_then_wildcard_origin_conflicts() {
        let ctx = ContextId::new();
        let mut registry = ChannelRegistry::new();
        registry.register(ctx, "http://x.com", "a", 1).unwrap();
        assert!(registry.register(ctx, "*", "a", 2).is_err());
        assert!(registry.register(ctx, "*", "b", 2).is_ok());
    }

    #[test]
    fn test_two_wildcards_on_same_context_conflict() {
        let ctx = ContextId::new();
        let mut registry = ChannelRegistry::new();
        registry.register(ctx, "*", "", 1).unwrap();
        assert!(registry.register(ctx, "*", "", 2).is_err());
    }

    #[test]
    fn test_distinct_contexts_or_origins_coexist() {
        let a = ContextId::new();
        let b = ContextId::new();
        let mut registry = ChannelRegistry::new();
        registry.register(a, "http://x.com", "s", 1).unwrap();
        registry.register(b, "http://x.com", "s", 2).unwrap();
        registry.register(a, "http://y.com", "s", 3).unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_route_prefers_exact_origin() {
        let ctx = ContextId::new();
        let mut registry = ChannelRegistry::new();
        registry.register(ctx, "*", "s", "wild").unwrap();
        registry.register(ctx, "http://y.com", "t", "exact").unwrap();
        assert_eq!(registry.route(ctx, "http://y.com", "s"), Some("wild"));
        assert_eq!(registry.route(ctx, "http://y.com", "t"), Some("exact"));
        assert_eq!(registry.route(ContextId::new(), "http://y.com", "t"), None);
    }

    #[test]
    fn test_unregister_prunes_buckets() {
        let ctx = ContextId::new();
        let mut registry = ChannelRegistry::new();
        registry.register(ctx, "http://x.com", "s", 1).unwrap();
        assert!(registry.unregister(ctx, "http://x.com", "s"));
        assert!(registry.is_empty());
        assert!(!registry.unregister(ctx, "http://x.com", "s"));
        // The slot is free again.
        registry.register(ctx, "*", "s", 2).unwrap();
    }
}
