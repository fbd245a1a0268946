// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # RPC Context
//!
//! Name → service table and the `"service.method"` call router.
//!
//! Routing order for [`RpcContext::dispatch_call`]:
//!
//! 1. split the identifier at the last `.`
//! 2. unknown service → `SERVICE_NOT_FOUND`
//! 3. method missing from the service's declared methods → `METHOD_NOT_FOUND`
//! 4. `private` method from a session → `PERMISSION_DENIED`
//! 5. `privileged` method from an unprivileged session → `PERMISSION_DENIED`
//! 6. argument schemas (`accepts`) fail → `INVALID_PARAMETERS`
//! 7. invoke; a panic in the handler becomes `CALL_ERROR`

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::application::dispatcher::DispatcherRef;
use crate::domain::error::RpcError;
use crate::domain::schema::SchemaRegistry;
use crate::domain::service::{positional, CallContext, Caller, MethodDescriptor, ServiceKind};

/// Names that can never be exported as methods
const RESERVED_METHODS: [&str; 3] = ["initialize", "methods", "call"];

/// A named collection of remotely callable methods
#[async_trait]
pub trait RpcService: Send + Sync {
    /// The exported methods of this service
    fn methods(&self) -> Vec<MethodDescriptor>;

    /// Called once right after the service is bound
    async fn initialize(&self, _dispatcher: &DispatcherRef) -> Result<(), RpcError> {
        Ok(())
    }

    async fn call(&self, method: &str, args: Vec<Value>, ctx: &CallContext) -> Result<Value, RpcError>;
}

struct Binding {
    kind: ServiceKind,
    service: Arc<dyn RpcService>,
    methods: HashMap<String, MethodDescriptor>,
}

pub struct RpcContext {
    services: RwLock<BTreeMap<String, Binding>>,
    schemas: Arc<SchemaRegistry>,
}

impl RpcContext {
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            services: RwLock::new(BTreeMap::new()),
            schemas,
        }
    }

    pub fn register(
        &self,
        name: &str,
        kind: ServiceKind,
        service: Arc<dyn RpcService>,
    ) -> Result<(), RpcError> {
        let mut services = self.services.write();
        if services.contains_key(name) {
            return Err(RpcError::already_registered("Service", name));
        }

        let mut methods = HashMap::new();
        for descriptor in service.methods() {
            if RESERVED_METHODS.contains(&descriptor.name.as_str()) {
                warn!(service = %name, method = %descriptor.name, "Ignoring reserved method name");
                continue;
            }
            methods.insert(descriptor.name.clone(), descriptor);
        }

        debug!(service = %name, kind = ?kind, methods = methods.len(), "Registered service");
        services.insert(
            name.to_string(),
            Binding {
                kind,
                service,
                methods,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn RpcService>> {
        self.services.write().remove(name).map(|b| b.service)
    }

    pub fn service(&self, name: &str) -> Option<Arc<dyn RpcService>> {
        self.services.read().get(name).map(|b| b.service.clone())
    }

    pub fn service_kind(&self, name: &str) -> Option<ServiceKind> {
        self.services.read().get(name).map(|b| b.kind)
    }

    pub fn get_services(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    pub fn get_methods(&self, service: &str) -> Result<Vec<MethodDescriptor>, RpcError> {
        let services = self.services.read();
        let binding = services
            .get(service)
            .ok_or_else(|| RpcError::service_not_found(service))?;
        let mut methods: Vec<MethodDescriptor> = binding.methods.values().cloned().collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(methods)
    }

    pub async fn dispatch_call(&self, method: &str, args: Value, caller: Caller) -> Result<Value, RpcError> {
        let (service_name, method_name) = method
            .rsplit_once('.')
            .ok_or_else(|| RpcError::service_not_found(method))?;

        let (service, descriptor) = {
            let services = self.services.read();
            let binding = services
                .get(service_name)
                .ok_or_else(|| RpcError::service_not_found(service_name))?;
            let descriptor = binding
                .methods
                .get(method_name)
                .cloned()
                .ok_or_else(|| RpcError::method_not_found(service_name, method_name))?;
            (binding.service.clone(), descriptor)
        };

        if descriptor.private && !caller.is_internal() {
            return Err(RpcError::permission_denied(format!("Method {} is private", method)));
        }
        if descriptor.privileged && !caller.is_privileged() {
            return Err(RpcError::permission_denied(format!(
                "Method {} requires a privileged session",
                method
            )));
        }

        let args = positional(args);
        if let Some(accepts) = &descriptor.accepts {
            self.schemas.validate_args(accepts, &args)?;
        }

        let ctx = CallContext {
            sender: if descriptor.pass_sender {
                caller.session().cloned()
            } else {
                None
            },
            caller,
        };

        debug!(method = %method, "Dispatching call");
        match AssertUnwindSafe(service.call(method_name, args, &ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                warn!(method = %method, panic = %message, "RPC handler panicked");
                Err(RpcError::call_error(message))
            }
        }
    }
}
