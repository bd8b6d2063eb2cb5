//! Registration-time method tables.
//!
//! Each provider type lists its methods once, as type-erased invokers keyed
//! by method name and parameter type names. An invoker:
//! 1. Downcasts the shared handler to its concrete type
//! 2. Decodes the JSON parameters into the method's argument types
//! 3. Calls the method and returns its future
//! 4. Encodes the result back to JSON values
//!
//! Binding failures (arity, parameter decoding) surface as
//! [`ReplyError::MethodInvocation`] before the method runs.
//!
//! # Example
//!
//! ```rust,ignore
//! impl Provider for EchoProvider {
//!     const INTERFACE_NAME: &'static str = "test/Echo";
//!
//!     fn method_table() -> MethodTable {
//!         MethodTable::builder::<Self>(Self::INTERFACE_NAME)
//!             .method1("echoString", "String", |this, input: String| async move {
//!                 Ok(this.echo(input))
//!             })
//!             .build()
//!     }
//! }
//! ```

use crate::error::{ProviderError, ReplyError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by an invoked method.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Vec<Value>, ProviderError>> + Send>>;

/// Type-erased handler function.
///
/// Takes the shared handler and the raw parameters, and either fails to bind
/// or returns the running method.
pub(crate) type Invoker =
    Arc<dyn Fn(SharedHandler, Vec<Value>) -> Result<MethodFuture, ReplyError> + Send + Sync>;

/// Handler instance shared between the registry and running invocations.
pub(crate) type SharedHandler = Arc<dyn Any + Send + Sync>;

/// Method name plus parameter type names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    /// Method name.
    pub name: String,
    /// Parameter type names, in order.
    pub param_types: Vec<String>,
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.param_types.join(", "))
    }
}

/// The callable methods of one provider type.
pub struct MethodTable {
    interface_name: String,
    methods: HashMap<MethodSignature, Invoker>,
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("interface_name", &self.interface_name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MethodTable {
    /// Start a table for handler type `H`.
    pub fn builder<H: Send + Sync + 'static>(interface_name: impl Into<String>) -> MethodTableBuilder<H> {
        MethodTableBuilder {
            interface_name: interface_name.into(),
            methods: HashMap::new(),
            _handler: PhantomData,
        }
    }

    /// Interface implemented by the handler type.
    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the table has no method.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Signatures of every method.
    pub fn signatures(&self) -> impl Iterator<Item = &MethodSignature> {
        self.methods.keys()
    }

    /// Find the method matching `name` and `param_types`.
    ///
    /// Callers that omit parameter types are matched by name and arity, as
    /// long as exactly one overload fits.
    pub(crate) fn lookup(
        &self,
        name: &str,
        param_types: &[String],
        arity: usize,
    ) -> Result<Invoker, ReplyError> {
        let signature = MethodSignature {
            name: name.to_string(),
            param_types: param_types.to_vec(),
        };
        if let Some(invoker) = self.methods.get(&signature) {
            return Ok(invoker.clone());
        }

        let mut overloads = self.methods.iter().filter(|(sig, _)| sig.name == name);
        if param_types.is_empty() {
            let mut by_arity = overloads.filter(|(sig, _)| sig.param_types.len() == arity);
            if let (Some((_, invoker)), None) = (by_arity.next(), by_arity.next()) {
                return Ok(invoker.clone());
            }
        } else if overloads.next().is_some() {
            return Err(ReplyError::method_invocation(format!(
                "no overload {}.{} matches",
                self.interface_name, signature
            )));
        }

        if self.methods.keys().any(|sig| sig.name == name) {
            Err(ReplyError::method_invocation(format!(
                "cannot resolve {}.{} with {} arguments",
                self.interface_name, name, arity
            )))
        } else {
            Err(ReplyError::method_invocation(format!(
                "unknown method {}.{}",
                self.interface_name, name
            )))
        }
    }
}

/// Builder collecting the methods of handler type `H`.
pub struct MethodTableBuilder<H> {
    interface_name: String,
    methods: HashMap<MethodSignature, Invoker>,
    _handler: PhantomData<fn() -> H>,
}

impl<H: Send + Sync + 'static> MethodTableBuilder<H> {
    /// Register a method working on raw JSON values.
    pub fn method<F, Fut>(mut self, name: &str, param_types: &[&str], f: F) -> Self
    where
        F: Fn(Arc<H>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>, ProviderError>> + Send + 'static,
    {
        let arity = param_types.len();
        let method_name = name.to_string();
        let invoker: Invoker = Arc::new(
            move |handler: SharedHandler, params: Vec<Value>| -> Result<MethodFuture, ReplyError> {
                let handler = downcast::<H>(handler, &method_name)?;
                check_arity(&method_name, arity, params.len())?;
                Ok(Box::pin(f(handler, params)) as MethodFuture)
            },
        );
        self.insert(name, param_types, invoker);
        self
    }

    /// Register a method without parameters.
    pub fn method0<R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        R: Serialize + Send + 'static,
        F: Fn(Arc<H>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ProviderError>> + Send + 'static,
    {
        let method_name = name.to_string();
        let invoker: Invoker = Arc::new(
            move |handler: SharedHandler, params: Vec<Value>| -> Result<MethodFuture, ReplyError> {
                let handler = downcast::<H>(handler, &method_name)?;
                check_arity(&method_name, 0, params.len())?;
                let fut = f(handler);
                Ok(Box::pin(async move { fut.await.and_then(encode_result) }) as MethodFuture)
            },
        );
        self.insert(name, &[], invoker);
        self
    }

    /// Register a method with one typed parameter.
    pub fn method1<A, R, F, Fut>(mut self, name: &str, param_type: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<H>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ProviderError>> + Send + 'static,
    {
        let method_name = name.to_string();
        let invoker: Invoker = Arc::new(
            move |handler: SharedHandler, params: Vec<Value>| -> Result<MethodFuture, ReplyError> {
                let handler = downcast::<H>(handler, &method_name)?;
                check_arity(&method_name, 1, params.len())?;
                let mut params = params.into_iter();
                let a = decode_param(&method_name, 0, params.next())?;
                let fut = f(handler, a);
                Ok(Box::pin(async move { fut.await.and_then(encode_result) }) as MethodFuture)
            },
        );
        self.insert(name, &[param_type], invoker);
        self
    }

    /// Register a method with two typed parameters.
    pub fn method2<A, B, R, F, Fut>(mut self, name: &str, param_types: [&str; 2], f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        B: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<H>, A, B) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ProviderError>> + Send + 'static,
    {
        let method_name = name.to_string();
        let invoker: Invoker = Arc::new(
            move |handler: SharedHandler, params: Vec<Value>| -> Result<MethodFuture, ReplyError> {
                let handler = downcast::<H>(handler, &method_name)?;
                check_arity(&method_name, 2, params.len())?;
                let mut params = params.into_iter();
                let a = decode_param(&method_name, 0, params.next())?;
                let b = decode_param(&method_name, 1, params.next())?;
                let fut = f(handler, a, b);
                Ok(Box::pin(async move { fut.await.and_then(encode_result) }) as MethodFuture)
            },
        );
        self.insert(name, &param_types, invoker);
        self
    }

    /// Finish the table.
    pub fn build(self) -> MethodTable {
        MethodTable {
            interface_name: self.interface_name,
            methods: self.methods,
        }
    }

    fn insert(&mut self, name: &str, param_types: &[&str], invoker: Invoker) {
        let signature = MethodSignature {
            name: name.to_string(),
            param_types: param_types.iter().map(|t| t.to_string()).collect(),
        };
        self.methods.insert(signature, invoker);
    }
}

fn downcast<H: Send + Sync + 'static>(
    handler: SharedHandler,
    method_name: &str,
) -> Result<Arc<H>, ReplyError> {
    handler.downcast::<H>().map_err(|_| {
        ReplyError::method_invocation(format!(
            "handler does not implement {method_name}: expected {}",
            std::any::type_name::<H>()
        ))
    })
}

fn check_arity(method_name: &str, expected: usize, actual: usize) -> Result<(), ReplyError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ReplyError::method_invocation(format!(
            "{method_name} takes {expected} arguments, got {actual}"
        )))
    }
}

fn decode_param<A: DeserializeOwned>(
    method_name: &str,
    index: usize,
    value: Option<Value>,
) -> Result<A, ReplyError> {
    serde_json::from_value(value.unwrap_or(Value::Null)).map_err(|err| {
        ReplyError::method_invocation(format!(
            "{method_name}: argument {index} has the wrong type: {err}"
        ))
    })
}

/// `()` yields an empty response. Any other value, `null` included, is one element.
fn encode_result<R: Serialize + 'static>(value: R) -> Result<Vec<Value>, ProviderError> {
    if TypeId::of::<R>() == TypeId::of::<()>() {
        return Ok(Vec::new());
    }
    match serde_json::to_value(value) {
        Ok(value) => Ok(vec![value]),
        Err(err) => Err(ProviderError::runtime(format!("cannot encode result: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Calc;

    fn table() -> MethodTable {
        MethodTable::builder::<Calc>("test/Calc")
            .method2("add", ["Integer", "Integer"], |_calc, a: i64, b: i64| async move { Ok(a + b) })
            .method1("add", "String", |_calc, a: String| async move { Ok(format!("{a}+")) })
            .method0("reset", |_calc| async move { Ok(()) })
            .method1("lookupName", "String", |_calc, _key: String| async move {
                Ok(None::<String>)
            })
            .build()
    }

    fn handler() -> SharedHandler {
        Arc::new(Calc)
    }

    #[tokio::test]
    async fn test_exact_signature_lookup() {
        let table = table();
        let invoker = table
            .lookup("add", &["Integer".into(), "Integer".into()], 2)
            .unwrap();
        let result = invoker(handler(), vec![json!(2), json!(3)]).unwrap().await;
        assert_eq!(result, Ok(vec![json!(5)]));
    }

    #[tokio::test]
    async fn test_unit_result_is_empty_response() {
        let table = table();
        let invoker = table.lookup("reset", &[], 0).unwrap();
        assert_eq!(invoker(handler(), vec![]).unwrap().await, Ok(vec![]));
    }

    #[tokio::test]
    async fn test_none_result_is_single_null() {
        let table = table();
        let invoker = table.lookup("lookupName", &["String".into()], 1).unwrap();
        let result = invoker(handler(), vec![json!("missing")]).unwrap().await;
        assert_eq!(result, Ok(vec![Value::Null]));
    }

    #[test]
    fn test_untyped_lookup_by_arity() {
        let table = table();
        assert!(table.lookup("add", &[], 1).is_ok());
        assert!(table.lookup("add", &[], 2).is_ok());
        assert!(table.lookup("add", &[], 3).is_err());
    }

    #[test]
    fn test_unknown_method_and_wrong_types() {
        let table = table();
        assert!(matches!(
            table.lookup("frobnicate", &[], 0),
            Err(ReplyError::MethodInvocation { .. })
        ));
        assert!(matches!(
            table.lookup("add", &["Boolean".into()], 1),
            Err(ReplyError::MethodInvocation { .. })
        ));
    }

    #[test]
    fn test_bad_param_value_is_method_invocation_error() {
        let table = table();
        let invoker = table
            .lookup("add", &["Integer".into(), "Integer".into()], 2)
            .unwrap();
        let bound = invoker(handler(), vec![json!("two"), json!(3)]);
        assert!(matches!(bound, Err(ReplyError::MethodInvocation { .. })));
    }
}
