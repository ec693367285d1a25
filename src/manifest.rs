use std::collections::HashMap;

use tracing::info;

use crate::handler::{CallKind, Handler};

/// Method name to handler table served by an [`RpcServer`](crate::RpcServer).
///
/// Built once before the server starts and read-only afterwards.
pub struct Manifest<C> {
    items: HashMap<String, Handler<C>>,
}

impl<C> Default for Manifest<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Manifest<C> {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
        }
    }

    /// Register a handler under `method`, replacing any previous one.
    ///
    /// # Example
    /// ```ignore
    /// let mut manifest = Manifest::new();
    /// manifest
    ///     .register("double", Handler::unary(|x: i64, _ctx: CallContext<()>| async move { Ok(x * 2) }))
    ///     .register("count", Handler::server_stream(|n: u64, _ctx: CallContext<()>| {
    ///         futures::stream::iter((0..n).map(Ok))
    ///     }));
    /// ```
    pub fn register(&mut self, method: impl Into<String>, handler: Handler<C>) -> &mut Self {
        let method = method.into();
        info!(method = %method, kind = %handler.kind(), "Registered RPC handler");
        self.items.insert(method, handler);
        self
    }

    pub fn get(&self, method: &str) -> Option<&Handler<C>> {
        self.items.get(method)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.items.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn methods(&self) -> impl Iterator<Item = (&str, CallKind)> {
        self.items.iter().map(|(name, h)| (name.as_str(), h.kind()))
    }
}

/// The client's view of a manifest: method names and their calling conventions.
#[derive(Debug, Clone, Default)]
pub struct ClientManifest {
    methods: HashMap<String, CallKind>,
}

impl ClientManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, method: impl Into<String>, kind: CallKind) -> Self {
        self.insert(method, kind);
        self
    }

    pub fn insert(&mut self, method: impl Into<String>, kind: CallKind) {
        self.methods.insert(method.into(), kind);
    }

    pub fn kind_of(&self, method: &str) -> Option<CallKind> {
        self.methods.get(method).copied()
    }
}

impl<C> From<&Manifest<C>> for ClientManifest {
    fn from(manifest: &Manifest<C>) -> Self {
        Self {
            methods: manifest
                .methods()
                .map(|(name, kind)| (name.to_string(), kind))
                .collect(),
        }
    }
}
