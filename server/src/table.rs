//! # Method Tables
//!
//! A [`MethodTable`] maps method names to async handlers, plus an optional
//! `init` entry. It is built once at startup and shared by every dispatcher
//! that serves it:
//!
//! ```no_run
//! # use bridge_server::{MethodTable, MethodError};
//! # use bridge_protocol::Value;
//! let table = MethodTable::new()
//!     .method("echo", |_ctx, args| async move {
//!         Ok(args.into_iter().next().unwrap_or_default())
//!     })
//!     .method("fail", |_ctx, _args| async move {
//!         Err::<Value, _>(MethodError::failed("requested failure"))
//!     });
//! ```
//!
//! Tables can also be a single flat handler that receives the method name
//! ([`MethodTable::from_fn`]); named entries take precedence over it.

use crate::outbox::{Progress, UpdateSender};
use bridge_protocol::Value;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MethodError {
    #[error("method not found: {0}")]
    NotFound(String),

    /// A domain failure; the message is what the caller sees.
    #[error("{0}")]
    Failed(String),

    #[error("method `{method}` panicked: {reason}")]
    Panicked { method: String, reason: String },
}

impl MethodError {
    pub fn failed(message: impl fmt::Display) -> Self {
        MethodError::Failed(message.to_string())
    }
}

/// Implicit context passed to every method call.
pub struct CallContext {
    pub(crate) name: String,
    pub(crate) origin: Option<String>,
    pub(crate) progress: Option<Progress>,
}

impl CallContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Origin (`scheme://host[:port]`) of the caller, when the transport
    /// knows it.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Present when the caller asked for streamed progress.
    pub fn progress(&self) -> Option<&Progress> {
        self.progress.as_ref()
    }

    pub fn is_canceled(&self) -> bool {
        self.progress.as_ref().is_some_and(Progress::is_canceled)
    }
}

/// Context passed to the `init` entry.
pub struct InitContext {
    pub origin: Option<String>,
    pub updates: UpdateSender,
}

pub type MethodFuture = BoxFuture<'static, Result<Value, MethodError>>;
pub type InitFuture = BoxFuture<'static, Result<(), MethodError>>;

type MethodFn = Arc<dyn Fn(CallContext, Vec<Value>) -> MethodFuture + Send + Sync>;
type FallbackFn = Arc<dyn Fn(String, CallContext, Vec<Value>) -> MethodFuture + Send + Sync>;
type InitFn = Arc<dyn Fn(InitContext, Vec<Value>) -> InitFuture + Send + Sync>;

#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodFn>,
    fallback: Option<FallbackFn>,
    init: Option<InitFn>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table backed by one handler that dispatches on the method name.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(String, CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        Self {
            fallback: Some(Arc::new(move |name, ctx, args| f(name, ctx, args).boxed())),
            ..Self::default()
        }
    }

    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Arc::new(move |ctx, args| f(ctx, args).boxed()));
        self
    }

    pub fn on_init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(InitContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MethodError>> + Send + 'static,
    {
        self.init = Some(Arc::new(move |ctx, args| f(ctx, args).boxed()));
        self
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name) || self.fallback.is_some()
    }

    /// Invokes `name`. Unknown names resolve to [`MethodError::NotFound`].
    pub fn call(&self, name: &str, ctx: CallContext, args: Vec<Value>) -> MethodFuture {
        if let Some(method) = self.methods.get(name) {
            return method(ctx, args);
        }
        match &self.fallback {
            Some(fallback) => fallback(name.to_owned(), ctx, args),
            None => {
                let err = MethodError::NotFound(name.to_owned());
                async move { Err(err) }.boxed()
            }
        }
    }

    /// Runs the `init` entry; a table without one accepts every `init`.
    pub fn init(&self, ctx: InitContext, args: Vec<Value>) -> InitFuture {
        match &self.init {
            Some(init) => init(ctx, args),
            None => async { Ok(()) }.boxed(),
        }
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("MethodTable")
            .field("methods", &names)
            .field("fallback", &self.fallback.is_some())
            .field("init", &self.init.is_some())
            .finish()
    }
}
