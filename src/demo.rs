//! A small agent exercising the full host surface: echo, arithmetic, state,
//! self-calls, scheduled tasks, and events. The daemon seeds one as
//! `restagent`, and the test suites use it as their fixture.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::agent::{Agent, AgentClass};
use crate::rpc::dispatch::{optional, required, MethodTable};
use crate::rpc::{JsonRpcRequest, RpcError};
use crate::types::StateError;

fn state_err(e: StateError) -> RpcError {
    RpcError::internal(e.to_string())
}

/// Demo agent with a bit of everything.
#[derive(Default)]
pub struct EchoAgent {
    config: Value,
}

impl Agent for EchoAgent {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
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

impl AgentClass for EchoAgent {
    const CLASS_NAME: &'static str = "EchoAgent";

    fn methods() -> MethodTable {
        MethodTable::builder(Self::CLASS_NAME)
            .operation::<Self, _, _>(
                "ping",
                &[required("message")],
                |_agent, mut args, _ctx| async move {
                    let message: String = args.take("message")?;
                    Ok(json!(message))
                },
            )
            .operation::<Self, _, _>("greet", &[], |_agent, _args, _ctx| async move {
                Ok(json!("hello"))
            })
            .operation::<Self, _, _>(
                "greet",
                &[required("name")],
                |_agent, mut args, _ctx| async move {
                    let name: String = args.take("name")?;
                    Ok(json!(format!("hello {name}")))
                },
            )
            .operation::<Self, _, _>(
                "add",
                &[required("a"), required("b")],
                |_agent, mut args, _ctx| async move {
                    let a: f64 = args.take("a")?;
                    let b: f64 = args.take("b")?;
                    Ok(json!(a + b))
                },
            )
            .operation::<Self, _, _>(
                "subtract",
                &[required("a"), required("b")],
                |_agent, mut args, _ctx| async move {
                    let a: f64 = args.take("a")?;
                    let b: f64 = args.take("b")?;
                    Ok(json!(a - b))
                },
            )
            .operation::<Self, _, _>(
                "put",
                &[required("key"), required("value")],
                |_agent, mut args, ctx| async move {
                    let key: String = args.take("key")?;
                    let value: Value = args.take("value")?;
                    ctx.put(&key, value).await.map_err(state_err)?;
                    Ok(Value::Null)
                },
            )
            .operation::<Self, _, _>(
                "get",
                &[required("key")],
                |_agent, mut args, ctx| async move {
                    let key: String = args.take("key")?;
                    Ok(ctx.get(&key).await.map_err(state_err)?.unwrap_or(Value::Null))
                },
            )
            .operation::<Self, _, _>(
                "call_myself",
                &[required("method"), required("params")],
                |_agent, mut args, ctx| async move {
                    let method: String = args.take("method")?;
                    let params: Value = args.take("params")?;
                    ctx.send(&ctx.url(), &method, params).await
                },
            )
            .operation::<Self, _, _>(
                "call_peer",
                &[required("url"), required("method"), optional("params")],
                |_agent, mut args, ctx| async move {
                    let url: String = args.take("url")?;
                    let method: String = args.take("method")?;
                    let params = args.opt::<Value>("params")?.unwrap_or(Value::Null);
                    ctx.send(&url, &method, params).await
                },
            )
            .operation::<Self, _, _>("cascade", &[], |_agent, _args, ctx| async move {
                ctx.send(&ctx.url(), "put", json!({"key": "x", "value": 42}))
                    .await?;
                let value = ctx.get("x").await.map_err(state_err)?.unwrap_or(Value::Null);
                Ok(json!(value.to_string()))
            })
            .raw_operation::<Self, _, _>("print_params", |_agent, args, _ctx| async move {
                let count = args.raw().as_object().map(|o| o.len()).unwrap_or(0);
                Ok(json!(format!("fields: {count}")))
            })
            .operation::<Self, _, _>(
                "create_task",
                &[required("delay")],
                |_agent, mut args, ctx| async move {
                    let delay: u64 = args.take("delay")?;
                    let request =
                        JsonRpcRequest::new("my_task", json!({"message": "hello world"}));
                    let id = ctx
                        .create_task(request, Duration::from_millis(delay))
                        .await
                        .map_err(|e| RpcError::internal(e.to_string()))?;
                    Ok(json!(id))
                },
            )
            .operation::<Self, _, _>(
                "cancel_task",
                &[required("id")],
                |_agent, mut args, ctx| async move {
                    let id: String = args.take("id")?;
                    ctx.cancel_task(&id)
                        .await
                        .map_err(|e| RpcError::internal(e.to_string()))?;
                    Ok(Value::Null)
                },
            )
            .operation::<Self, _, _>(
                "schedule_note",
                &[required("message"), required("delay")],
                |_agent, mut args, ctx| async move {
                    let message: String = args.take("message")?;
                    let delay: u64 = args.take("delay")?;
                    let request = JsonRpcRequest::new("my_task", json!({"message": message}));
                    let id = ctx
                        .create_task(request, Duration::from_millis(delay))
                        .await
                        .map_err(|e| RpcError::internal(e.to_string()))?;
                    Ok(json!(id))
                },
            )
            .operation::<Self, _, _>(
                "my_task",
                &[required("message")],
                |_agent, mut args, ctx| async move {
                    let message: String = args.take("message")?;
                    tracing::info!(agent_id = %ctx.agent_id, %message, "my_task executed");
                    ctx.put("last_task_message", json!(message.clone()))
                        .await
                        .map_err(state_err)?;
                    let mut log = ctx
                        .get("task_log")
                        .await
                        .map_err(state_err)?
                        .and_then(|v| v.as_array().cloned())
                        .unwrap_or_default();
                    log.push(json!(message));
                    ctx.put("task_log", Value::Array(log))
                        .await
                        .map_err(state_err)?;
                    Ok(Value::Null)
                },
            )
            .operation::<Self, _, _>(
                "register_ping_event",
                &[],
                |_agent, _args, ctx| async move {
                    ctx.subscribe(&ctx.url(), "ping", "ping_callback").await?;
                    Ok(Value::Null)
                },
            )
            .operation::<Self, _, _>(
                "unregister_ping_event",
                &[],
                |_agent, _args, ctx| async move {
                    ctx.unsubscribe(&ctx.url(), "ping", "ping_callback").await?;
                    Ok(Value::Null)
                },
            )
            .operation::<Self, _, _>(
                "trigger_ping_event",
                &[optional("message")],
                |_agent, mut args, ctx| async move {
                    let params = match args.opt::<String>("message")? {
                        Some(message) => json!({"message": message}),
                        None => Value::Null,
                    };
                    let delivered = ctx.trigger("ping", params).await.map_err(state_err)?;
                    Ok(json!(delivered))
                },
            )
            .operation::<Self, _, _>(
                "ping_callback",
                &[required("params")],
                |_agent, mut args, ctx| async move {
                    let params: Value = args.take("params")?;
                    let count = ctx
                        .get("ping_count")
                        .await
                        .map_err(state_err)?
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    ctx.put("ping_count", json!(count + 1))
                        .await
                        .map_err(state_err)?;
                    ctx.put("last_ping_params", params)
                        .await
                        .map_err(state_err)?;
                    Ok(Value::Null)
                },
            )
            .operation::<Self, _, _>(
                "on_event",
                &[required("agent"), required("event"), optional("params")],
                |_agent, mut args, ctx| async move {
                    let agent: String = args.take("agent")?;
                    let event: String = args.take("event")?;
                    let params = args.opt::<Value>("params")?.unwrap_or(Value::Null);
                    ctx.put(
                        "last_event",
                        json!({"agent": agent, "event": event, "params": params}),
                    )
                    .await
                    .map_err(state_err)?;
                    Ok(Value::Null)
                },
            )
            .operation::<Self, _, _>("fail", &[], |_agent, _args, _ctx| async move {
                Err::<Value, _>(RpcError::internal("something went wrong..."))
            })
            .operation::<Self, _, _>("fail_not_found", &[], |_agent, _args, _ctx| async move {
                Err::<Value, _>(RpcError::not_found("no such thing"))
            })
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_exposes_the_expected_operations() {
        let table = EchoAgent::methods();
        let names = table.method_names();
        for expected in ["ping", "greet", "cascade", "print_params", "create_task"] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn config_is_injected_before_sharing() {
        let mut agent = EchoAgent::default();
        agent.set_config(json!({"mood": "calm"}));
        assert_eq!(agent.config(), json!({"mood": "calm"}));
    }
}
