//! Declarative dispatch tables.
//!
//! Instead of runtime reflection, every agent class publishes a table mapping
//! method name to parameter metadata plus a pre-built invoker closure. The
//! dispatcher binds the request's params object to the declared names and
//! hands the bound arguments to the invoker.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::{JsonRpcRequest, JsonRpcResponse, RpcError};
use crate::agent::{Agent, AgentContext};

/// Declared parameter: a name tag plus a required flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDef {
    pub name: &'static str,
    pub required: bool,
}

/// A required named parameter.
pub fn required(name: &'static str) -> ParamDef {
    ParamDef {
        name,
        required: true,
    }
}

/// An optional named parameter, bound to JSON null when absent.
pub fn optional(name: &'static str) -> ParamDef {
    ParamDef {
        name,
        required: false,
    }
}

/// Arguments bound for one invocation.
pub struct Args {
    bound: Map<String, Value>,
    raw: Value,
}

impl Args {
    /// Take a bound parameter and coerce it to its declared type.
    pub fn take<T: DeserializeOwned>(&mut self, name: &str) -> Result<T, RpcError> {
        let value = self.bound.remove(name).unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| RpcError::invalid_params(format!("parameter {name}: {e}")))
    }

    /// Take an optional parameter; absent or null binds to `None`.
    pub fn opt<T: DeserializeOwned>(&mut self, name: &str) -> Result<Option<T>, RpcError> {
        match self.bound.remove(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RpcError::invalid_params(format!("parameter {name}: {e}"))),
        }
    }

    /// The whole params object, for raw-params operations.
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

type Invoker = Box<
    dyn Fn(Arc<dyn Agent>, Args, AgentContext) -> BoxFuture<'static, Result<Value, RpcError>>
        + Send
        + Sync,
>;

/// One dispatchable operation.
pub struct MethodDef {
    name: &'static str,
    params: Vec<ParamDef>,
    raw_params: bool,
    invoker: Invoker,
}

impl MethodDef {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn params(&self) -> &[ParamDef] {
        &self.params
    }

    /// Every required name present and no supplied key outside the declared
    /// names.
    fn matches_exactly(&self, supplied: &Map<String, Value>) -> bool {
        !self.raw_params
            && self
                .params
                .iter()
                .filter(|p| p.required)
                .all(|p| supplied.contains_key(p.name))
            && supplied
                .keys()
                .all(|k| self.params.iter().any(|p| p.name == k))
    }

    /// Every required name present; extra supplied keys tolerated.
    fn covers_required(&self, supplied: &Map<String, Value>) -> bool {
        !self.raw_params
            && self
                .params
                .iter()
                .filter(|p| p.required)
                .all(|p| supplied.contains_key(p.name))
    }

    /// Bind the params object to the declared parameters.
    fn bind(&self, params: &Map<String, Value>) -> Result<Args, RpcError> {
        let mut bound = Map::new();
        if !self.raw_params {
            for param in &self.params {
                match params.get(param.name) {
                    Some(value) => {
                        bound.insert(param.name.to_string(), value.clone());
                    }
                    None if param.required => {
                        return Err(RpcError::invalid_params(format!(
                            "missing required parameter: {}",
                            param.name
                        )));
                    }
                    None => {
                        bound.insert(param.name.to_string(), Value::Null);
                    }
                }
            }
        }
        Ok(Args {
            bound,
            raw: Value::Object(params.clone()),
        })
    }
}

/// Per-class dispatch table. Built once when the class is registered and
/// immutable afterwards.
pub struct MethodTable {
    class_name: &'static str,
    methods: HashMap<&'static str, Vec<MethodDef>>,
}

impl MethodTable {
    pub fn builder(class_name: &'static str) -> MethodTableBuilder {
        MethodTableBuilder {
            class_name,
            defs: Vec::new(),
        }
    }

    pub fn class_name(&self) -> &'static str {
        self.class_name
    }

    pub fn method_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Select the operation for a method name and params object.
    ///
    /// Overloads resolve in three tiers: exact name coverage, the raw-params
    /// escape hatch, then required-only coverage. A lone candidate is
    /// returned even if it cannot bind, so the caller gets a precise
    /// missing-parameter error instead of a generic one.
    pub fn resolve(
        &self,
        method: &str,
        supplied: &Map<String, Value>,
    ) -> Result<&MethodDef, RpcError> {
        let Some(defs) = self.methods.get(method) else {
            return Err(RpcError::method_not_found(method));
        };
        if let Some(def) = defs.iter().find(|d| d.matches_exactly(supplied)) {
            return Ok(def);
        }
        if let Some(def) = defs.iter().find(|d| d.raw_params) {
            return Ok(def);
        }
        if let Some(def) = defs.iter().find(|d| d.covers_required(supplied)) {
            return Ok(def);
        }
        if let [only] = defs.as_slice() {
            return Ok(only);
        }
        Err(RpcError::invalid_params(format!(
            "no overload of {method} matches the supplied parameters"
        )))
    }
}

/// Builder for a class's dispatch table.
pub struct MethodTableBuilder {
    class_name: &'static str,
    defs: Vec<MethodDef>,
}

impl MethodTableBuilder {
    /// Register an operation with named parameters.
    pub fn operation<A, F, Fut>(mut self, name: &'static str, params: &[ParamDef], f: F) -> Self
    where
        A: Agent,
        F: Fn(Arc<A>, Args, AgentContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.defs.push(MethodDef {
            name,
            params: params.to_vec(),
            raw_params: false,
            invoker: wrap_invoker::<A, F, Fut>(f),
        });
        self
    }

    /// Register an operation receiving the entire params object.
    pub fn raw_operation<A, F, Fut>(mut self, name: &'static str, f: F) -> Self
    where
        A: Agent,
        F: Fn(Arc<A>, Args, AgentContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.defs.push(MethodDef {
            name,
            params: Vec::new(),
            raw_params: true,
            invoker: wrap_invoker::<A, F, Fut>(f),
        });
        self
    }

    /// Validate and freeze the table. Operations with an unnamed or
    /// duplicated parameter are rejected and not exposed.
    pub fn build(self) -> MethodTable {
        let mut methods: HashMap<&'static str, Vec<MethodDef>> = HashMap::new();
        for def in self.defs {
            let mut seen = Vec::new();
            let invalid = def.params.iter().any(|p| {
                let bad = p.name.is_empty() || seen.contains(&p.name);
                seen.push(p.name);
                bad
            });
            if invalid {
                tracing::warn!(
                    class = self.class_name,
                    method = def.name,
                    "operation has an unnamed or duplicated parameter, not exposing it"
                );
                continue;
            }
            methods.entry(def.name).or_default().push(def);
        }
        MethodTable {
            class_name: self.class_name,
            methods,
        }
    }
}

fn wrap_invoker<A, F, Fut>(f: F) -> Invoker
where
    A: Agent,
    F: Fn(Arc<A>, Args, AgentContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Box::new(
        move |agent, args, ctx| -> BoxFuture<'static, Result<Value, RpcError>> {
            match agent.into_any().downcast::<A>() {
                Ok(this) => Box::pin(f(this, args, ctx)),
                Err(_) => Box::pin(std::future::ready(Err(RpcError::internal(
                    "dispatch table does not match the target agent class",
                )))),
            }
        },
    )
}

/// Pluggable per-request yes/no predicate consulted before invocation.
pub trait Authorizor: Send + Sync {
    fn authorize(&self, method: &str, sender: Option<&str>) -> bool;
}

/// Authorizor admitting only an explicit set of methods.
pub struct MethodAllowList {
    allowed: Vec<String>,
}

impl MethodAllowList {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }
}

impl Authorizor for MethodAllowList {
    fn authorize(&self, method: &str, _sender: Option<&str>) -> bool {
        self.allowed.iter().any(|m| m == method)
    }
}

/// Dispatch a request against an agent and produce the response envelope.
pub async fn dispatch(
    table: &MethodTable,
    agent: Arc<dyn Agent>,
    ctx: AgentContext,
    authorizor: Option<&Arc<dyn Authorizor>>,
    request: &JsonRpcRequest,
) -> JsonRpcResponse {
    let id = request.id.clone();
    let supplied = match &request.params {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => {
            return JsonRpcResponse::failure(
                id,
                RpcError::invalid_request("params must be an object"),
            );
        }
    };

    let def = match table.resolve(&request.method, &supplied) {
        Ok(def) => def,
        Err(error) => return JsonRpcResponse::failure(id, error),
    };

    if let Some(authorizor) = authorizor {
        if !authorizor.authorize(&request.method, ctx.sender_url.as_deref()) {
            return JsonRpcResponse::failure(id, RpcError::not_authorized(&request.method));
        }
    }

    let args = match def.bind(&supplied) {
        Ok(args) => args,
        Err(error) => return JsonRpcResponse::failure(id, error),
    };

    match (def.invoker)(agent, args, ctx).await {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(error) => JsonRpcResponse::failure(id, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{code, JsonRpcRequest};
    use serde_json::json;
    use std::any::Any;

    #[derive(Default)]
    struct Calc {
        config: Value,
    }

    impl Agent for Calc {
        fn class_name(&self) -> &'static str {
            "Calc"
        }

        fn set_config(&mut self, config: Value) {
            self.config = config;
        }

        fn config(&self) -> Value {
            self.config.clone()
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn table() -> MethodTable {
        MethodTable::builder("Calc")
            .operation::<Calc, _, _>(
                "ping",
                &[required("message")],
                |_agent, mut args, _ctx| async move {
                    let message: String = args.take("message")?;
                    Ok(json!(message))
                },
            )
            .operation::<Calc, _, _>("greet", &[], |_agent, _args, _ctx| async move {
                Ok(json!("hello"))
            })
            .operation::<Calc, _, _>(
                "greet",
                &[required("name")],
                |_agent, mut args, _ctx| async move {
                    let name: String = args.take("name")?;
                    Ok(json!(format!("hello {name}")))
                },
            )
            .operation::<Calc, _, _>(
                "note",
                &[optional("text")],
                |_agent, mut args, _ctx| async move {
                    Ok(json!(args.opt::<String>("text")?.unwrap_or_default()))
                },
            )
            .raw_operation::<Calc, _, _>("raw_count", |_agent, args, _ctx| async move {
                Ok(json!(args.raw().as_object().map(|o| o.len()).unwrap_or(0)))
            })
            .operation::<Calc, _, _>("void_op", &[], |_agent, _args, _ctx| async move {
                Ok(Value::Null)
            })
            .operation::<Calc, _, _>(
                "unnamed_param",
                &[ParamDef {
                    name: "",
                    required: true,
                }],
                |_agent, _args, _ctx| async move { Ok(Value::Null) },
            )
            .build()
    }

    async fn call(method: &str, params: Value) -> JsonRpcResponse {
        let table = table();
        let agent: Arc<dyn Agent> = Arc::new(Calc::default());
        let request = JsonRpcRequest::new(method, params).with_id(json!(7));
        dispatch(&table, agent, AgentContext::detached("t"), None, &request).await
    }

    #[tokio::test]
    async fn binds_parameters_by_name() {
        let response = call("ping", json!({"message": "hi"})).await;
        assert_eq!(response.result, Some(json!("hi")));
        assert_eq!(response.id, Some(json!(7)));
    }

    #[tokio::test]
    async fn missing_required_parameter_is_invalid_params() {
        let response = call("ping", json!({})).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, code::INVALID_PARAMS);
        assert!(error.message.contains("message"));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let response = call("nope", json!({})).await;
        assert_eq!(response.error.unwrap().code, code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn overloads_select_by_supplied_names() {
        let bare = call("greet", json!({})).await;
        assert_eq!(bare.result, Some(json!("hello")));

        let named = call("greet", json!({"name": "bob"})).await;
        assert_eq!(named.result, Some(json!("hello bob")));
    }

    #[tokio::test]
    async fn optional_parameters_bind_to_absent() {
        let response = call("note", json!({})).await;
        assert_eq!(response.result, Some(json!("")));
    }

    #[tokio::test]
    async fn raw_operations_see_the_whole_object() {
        let response = call("raw_count", json!({"a": 1, "b": 2})).await;
        assert_eq!(response.result, Some(json!(2)));
    }

    #[tokio::test]
    async fn void_operations_produce_a_null_result() {
        let response = call("void_op", json!({})).await;
        assert!(response.error.is_none());
        assert_eq!(response.result, Some(Value::Null));
    }

    #[tokio::test]
    async fn operations_with_unnamed_parameters_are_not_exposed() {
        let response = call("unnamed_param", json!({})).await;
        assert_eq!(response.error.unwrap().code, code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn non_object_params_are_an_invalid_request() {
        let response = call("ping", json!([1, 2, 3])).await;
        assert_eq!(response.error.unwrap().code, code::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn null_params_count_as_the_empty_object() {
        let response = call("greet", Value::Null).await;
        assert_eq!(response.result, Some(json!("hello")));
    }

    #[tokio::test]
    async fn authorizor_refusal_short_circuits() {
        let table = table();
        let agent: Arc<dyn Agent> = Arc::new(Calc::default());
        let authorizor: Arc<dyn Authorizor> =
            Arc::new(MethodAllowList::new(vec!["greet".to_string()]));
        let request = JsonRpcRequest::new("ping", json!({"message": "x"}));
        let response = dispatch(
            &table,
            agent,
            AgentContext::detached("t"),
            Some(&authorizor),
            &request,
        )
        .await;
        assert_eq!(response.error.unwrap().code, code::NOT_AUTHORIZED);
    }
}
