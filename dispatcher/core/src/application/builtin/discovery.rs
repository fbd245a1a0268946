// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! `discovery`: what services, methods and task types exist.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::application::dispatcher::DispatcherRef;
use crate::application::rpc_context::RpcService;
use crate::domain::error::RpcError;
use crate::domain::service::{arg, CallContext, MethodDescriptor};

pub struct DiscoveryService {
    dispatcher: DispatcherRef,
}

impl DiscoveryService {
    pub fn new(dispatcher: DispatcherRef) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl RpcService for DiscoveryService {
    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![
            MethodDescriptor::new("get_services")
                .description("Names of all registered services")
                .returns(json!({"type": "array", "items": {"type": "string"}})),
            MethodDescriptor::new("get_methods")
                .description("Exported methods of a service")
                .accepts(vec![json!({"type": "string"})]),
            MethodDescriptor::new("get_tasks")
                .description("Names of all registered task handlers")
                .returns(json!({"type": "array", "items": {"type": "string"}})),
        ]
    }

    async fn call(&self, method: &str, args: Vec<Value>, _ctx: &CallContext) -> Result<Value, RpcError> {
        let dispatcher = self.dispatcher.get()?;
        match method {
            "get_services" => Ok(json!(dispatcher.rpc().get_services())),
            "get_methods" => {
                let service: String = arg(&args, 0, "service")?;
                Ok(serde_json::to_value(dispatcher.rpc().get_methods(&service)?)?)
            }
            "get_tasks" => Ok(json!(dispatcher.balancer().handler_names())),
            other => Err(RpcError::method_not_found("discovery", other)),
        }
    }
}
