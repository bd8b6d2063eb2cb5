//! Binds inbound requests to provider methods and runs them.
//!
//! # Resolution
//!
//! ```text
//! execute(callback, caller, request)
//!   ├─ method_cache[(handler type, method, param types, arity)] ┐
//!   │    miss: tables[handler type] (built once) → lookup ─────┤
//!   └─ invoker(handler, params) → future ── spawn ── callback ◄┘
//! ```
//!
//! A resolution failure never reaches the provider: the callback receives
//! [`ReplyError::MethodInvocation`]. Panics in the binding step or while the
//! method future is polled are caught and reported the same way.

use crate::dispatch::method::{Invoker, MethodFuture};
use crate::dispatch::{MethodTable, ProviderCallback, RequestCaller};
use crate::error::ReplyError;
use crate::message::{OneWayRequest, Reply, Request};
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Untyped requests resolve by name and arity, so the arity is part of the key.
type CacheKey = (TypeId, String, Vec<String>, usize);

/// Resolves and invokes provider methods, caching resolutions.
#[derive(Default)]
pub struct RequestInterpreter {
    tables: DashMap<TypeId, Arc<MethodTable>>,
    method_cache: DashMap<CacheKey, Invoker>,
    resolutions: AtomicU64,
}

impl RequestInterpreter {
    /// Create an interpreter with empty caches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the method table of `caller`'s handler type if not known yet.
    pub fn register(&self, caller: &RequestCaller) -> Arc<MethodTable> {
        self.tables
            .entry(caller.handler_type())
            .or_insert_with(|| {
                let table = caller.build_table();
                tracing::debug!(
                    interface = table.interface_name(),
                    handler = caller.handler_type_name(),
                    methods = table.len(),
                    "Method table built"
                );
                Arc::new(table)
            })
            .clone()
    }

    /// Number of lookups that missed the method cache.
    pub fn resolution_count(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    /// Invoke `request` on `caller` and resolve `callback` exactly once.
    ///
    /// The method runs on a spawned task; this returns immediately. Must be
    /// called within a tokio runtime.
    pub fn execute(&self, callback: Box<dyn ProviderCallback>, caller: &RequestCaller, request: Request) {
        let Request {
            method_name,
            params,
            param_datatypes,
            request_reply_id,
        } = request;

        let future = match self.bind(caller, &method_name, &param_datatypes, params) {
            Ok(future) => future,
            Err(error) => {
                tracing::debug!(
                    %request_reply_id,
                    method = %method_name,
                    error = %error,
                    "Request could not be bound"
                );
                callback.on_failure(error);
                return;
            }
        };

        tokio::spawn(async move {
            match run(future).await {
                Ok(response) => {
                    tracing::trace!(%request_reply_id, method = %method_name, "Request handled");
                    callback.on_success(Reply::success(request_reply_id, response));
                }
                Err(error) => {
                    tracing::debug!(
                        %request_reply_id,
                        method = %method_name,
                        error = %error,
                        "Request failed"
                    );
                    callback.on_failure(error);
                }
            }
        });
    }

    /// Invoke a one-way `request` on `caller`. The outcome is only logged.
    pub fn invoke_method(&self, caller: &RequestCaller, request: OneWayRequest) {
        let OneWayRequest {
            method_name,
            params,
            param_datatypes,
        } = request;

        let future = match self.bind(caller, &method_name, &param_datatypes, params) {
            Ok(future) => future,
            Err(error) => {
                tracing::warn!(method = %method_name, error = %error, "One-way request could not be bound");
                return;
            }
        };

        tokio::spawn(async move {
            if let Err(error) = run(future).await {
                tracing::warn!(method = %method_name, error = %error, "One-way request failed");
            }
        });
    }

    fn resolve(
        &self,
        caller: &RequestCaller,
        method_name: &str,
        param_types: &[String],
        arity: usize,
    ) -> Result<Invoker, ReplyError> {
        let key: CacheKey = (
            caller.handler_type(),
            method_name.to_string(),
            param_types.to_vec(),
            arity,
        );
        if let Some(invoker) = self.method_cache.get(&key) {
            return Ok(invoker.clone());
        }

        self.resolutions.fetch_add(1, Ordering::Relaxed);
        let table = self.register(caller);
        let invoker = table.lookup(method_name, param_types, arity)?;
        self.method_cache.insert(key, invoker.clone());
        Ok(invoker)
    }

    fn bind(
        &self,
        caller: &RequestCaller,
        method_name: &str,
        param_types: &[String],
        params: Vec<Value>,
    ) -> Result<MethodFuture, ReplyError> {
        let invoker = self.resolve(caller, method_name, param_types, params.len())?;
        let handler = caller.handler();
        std::panic::catch_unwind(AssertUnwindSafe(|| invoker(handler, params)))
            .unwrap_or_else(|panic| Err(panic_error(method_name, panic)))
    }
}

async fn run(future: MethodFuture) -> Result<Vec<Value>, ReplyError> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(outcome) => outcome.map_err(ReplyError::from),
        Err(panic) => Err(panic_error("method", panic)),
    }
}

fn panic_error(context: &str, panic: Box<dyn Any + Send>) -> ReplyError {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    ReplyError::method_invocation(format!("{context} panicked: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Provider;
    use crate::error::ProviderError;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Echo;

    impl Provider for Echo {
        const INTERFACE_NAME: &'static str = "test/Echo";

        fn method_table() -> MethodTable {
            MethodTable::builder::<Self>(Self::INTERFACE_NAME)
                .method1("echoString", "String", |_this, input: String| async move { Ok(input) })
                .method0("explode", |_this| async move {
                    if true {
                        panic!("boom");
                    }
                    Ok(())
                })
                .method0("ping", |_this| async move { Ok("pong".to_string()) })
                .method1("reject", "String", |_this, reason: String| async move {
                    Err::<(), _>(ProviderError::application("Rejected", reason))
                })
                .build()
        }
    }

    fn execute(
        interpreter: &RequestInterpreter,
        request: Request,
    ) -> mpsc::UnboundedReceiver<Result<Reply, ReplyError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let caller = RequestCaller::new(Arc::new(Echo));
        interpreter.execute(
            Box::new(move |outcome: Result<Reply, ReplyError>| {
                let _ = tx.send(outcome);
            }),
            &caller,
            request,
        );
        rx
    }

    #[tokio::test]
    async fn test_echo_success() {
        let interpreter = RequestInterpreter::new();
        let request = Request::new("echoString", vec![json!("hello")], vec!["String".into()])
            .with_request_reply_id("x1");
        let reply = execute(&interpreter, request).recv().await.unwrap().unwrap();
        assert_eq!(reply, Reply::success("x1".into(), vec![json!("hello")]));
    }

    #[tokio::test]
    async fn test_panic_becomes_method_invocation() {
        let interpreter = RequestInterpreter::new();
        let request = Request::new("explode", vec![], vec![]);
        let outcome = execute(&interpreter, request).recv().await.unwrap();
        assert!(matches!(outcome, Err(ReplyError::MethodInvocation { .. })));
    }

    #[tokio::test]
    async fn test_application_error_is_verbatim() {
        let interpreter = RequestInterpreter::new();
        let request = Request::new("reject", vec![json!("no")], vec!["String".into()]);
        let outcome = execute(&interpreter, request).recv().await.unwrap();
        assert_eq!(
            outcome,
            Err(ReplyError::Application {
                error_name: "Rejected".into(),
                message: "no".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_resolution_is_cached() {
        let interpreter = RequestInterpreter::new();
        for _ in 0..3 {
            let request = Request::new("echoString", vec![json!("a")], vec!["String".into()]);
            execute(&interpreter, request).recv().await.unwrap().unwrap();
        }
        assert_eq!(interpreter.resolution_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_argument_resolution_is_cached() {
        let interpreter = RequestInterpreter::new();
        for _ in 0..3 {
            let request = Request::new("ping", vec![], vec![]);
            let reply = execute(&interpreter, request).recv().await.unwrap().unwrap();
            assert_eq!(reply.response, vec![json!("pong")]);
        }
        assert_eq!(interpreter.resolution_count(), 1);
    }

    #[tokio::test]
    async fn test_untyped_lookups_are_cached_per_arity() {
        let interpreter = RequestInterpreter::new();
        for _ in 0..2 {
            let request = Request::new("echoString", vec![json!("a")], vec![]);
            execute(&interpreter, request).recv().await.unwrap().unwrap();
        }
        assert_eq!(interpreter.resolution_count(), 1);

        let request = Request::new("echoString", vec![json!("a"), json!("b")], vec![]);
        let outcome = execute(&interpreter, request).recv().await.unwrap();
        assert!(matches!(outcome, Err(ReplyError::MethodInvocation { .. })));
        assert_eq!(interpreter.resolution_count(), 2);
    }
}
