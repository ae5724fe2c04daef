//! The central Model Context Protocol engine
//!
//! Owns the tool, resource and prompt registries, negotiates capabilities
//! through `initialize`, enforces the initialization state machine, and routes
//! every decoded request to its handler.

pub mod audit;
pub mod context;
pub mod error;
pub mod registry;

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, OnceLock, Weak},
};

use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::{
    pool::panic_message,
    protocol::{
        codec::{self, notification_value},
        error::SERVER_NOT_INITIALIZED,
        types::{
            CallToolResult, GetPromptResult, InitializeResult, ListChangedCapability, Prompt,
            Resource, ResourceContents, ResourceTemplate, ResourcesCapability, ServerCapabilities,
            ServerInfo, Tool,
        },
        Message, Notification, Request, RequestId, Response, LATEST_PROTOCOL_VERSION,
        SUPPORTED_PROTOCOL_VERSIONS,
    },
    template::{compile_uri_template, TemplateError},
    transport::{Capability, ConnectionId, Transport, TransportKind},
};

pub use context::{CancellationToken, Cancelled, RequestContext, TransportHandle};
pub use error::{ServerError, Severity};
pub use registry::{
    Handler, HandlerError, HandlerResult, NotificationHandler, PromptHandler, ResourceHandler,
    ResourceRequest, ToolHandler,
};

use registry::Registry;

/// Anything a transport can hand decoded messages to.
pub trait Dispatch: Send + Sync + 'static {
    fn info(&self) -> &ServerInfo;

    fn is_initialized(&self) -> bool;

    fn handle_request(&self, request: Request, ctx: RequestContext) -> Response;

    fn handle_notification(&self, notification: Notification, ctx: RequestContext);

    /// Registers a running transport as a target for server-initiated
    /// notifications such as `list_changed`.
    fn attach_transport(&self, transport: Weak<dyn Transport>);
}

/// Read and invoke access to a set of tools, resources and prompts.
///
/// Implemented by [`McpServer`] over its own registries and by
/// [`crate::compose::ComposedServer`] over its mounts.
pub trait Catalog: Send + Sync {
    fn list_tools(&self) -> Vec<Tool>;

    fn has_tool(&self, name: &str) -> bool {
        self.list_tools().iter().any(|tool| tool.name == name)
    }

    fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<CallToolResult, ServerError>;

    fn list_resources(&self) -> Vec<Resource>;

    fn list_resource_templates(&self) -> Vec<ResourceTemplate>;

    fn read_resource(&self, uri: &str, ctx: &RequestContext)
        -> Result<ResourceContents, ServerError>;

    fn list_prompts(&self) -> Vec<Prompt>;

    fn has_prompt(&self, name: &str) -> bool {
        self.list_prompts().iter().any(|prompt| prompt.name == name)
    }

    fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<GetPromptResult, ServerError>;

    /// Registers a callback for every later change to this catalog's lists,
    /// whether or not a client has initialized it.
    fn watch_list_changes(&self, _listener: ListChangeListener) {}
}

pub type ListChangeListener = Arc<dyn Fn(ListKind) + Send + Sync>;

/// Which advertised list a `list_changed` notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Tools,
    Resources,
    Prompts,
}

impl ListKind {
    pub fn notification_method(self) -> &'static str {
        match self {
            Self::Tools => "notifications/tools/list_changed",
            Self::Resources => "notifications/resources/list_changed",
            Self::Prompts => "notifications/prompts/list_changed",
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ReadResourceParams {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct GetPromptParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// Request ids are only unique per client, so in-flight calls are keyed by the
/// connection they arrived on as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InFlightKey {
    origin: Option<(TransportKind, ConnectionId)>,
    id: RequestId,
}

impl InFlightKey {
    fn new(ctx: &RequestContext, id: RequestId) -> Self {
        let origin = ctx
            .transport()
            .filter(|handle| handle.kind().has_sessions())
            .and_then(|handle| handle.connection_id().map(|connection| (handle.kind(), connection)));
        Self { origin, id }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelledParams {
    request_id: Value,
    #[serde(default)]
    reason: Option<String>,
}

pub struct McpServer {
    info: ServerInfo,
    instructions: Option<String>,
    registry: RwLock<Registry>,
    notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
    /// Capability snapshot frozen by the first successful `initialize`.
    session: OnceLock<InitializeResult>,
    in_flight: Mutex<HashMap<InFlightKey, CancellationToken>>,
    transports: Mutex<Vec<Weak<dyn Transport>>>,
    list_watchers: Mutex<Vec<ListChangeListener>>,
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: ServerInfo::new(name, version),
            instructions: None,
            registry: RwLock::new(Registry::default()),
            notification_handlers: RwLock::new(HashMap::new()),
            session: OnceLock::new(),
            in_flight: Mutex::new(HashMap::new()),
            transports: Mutex::new(Vec::new()),
            list_watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn register_tool(&self, tool: Tool, handler: ToolHandler) {
        let name = tool.name.clone();
        if self.registry.write().insert_tool(tool, handler) {
            debug!(tool = %name, "replaced existing tool registration");
        }
        self.notify_list_changed(ListKind::Tools);
    }

    pub fn register_resource(&self, resource: Resource, handler: ResourceHandler) {
        let uri = resource.uri.clone();
        if self.registry.write().insert_resource(resource, handler) {
            debug!(uri = %uri, "replaced existing resource registration");
        }
        self.notify_list_changed(ListKind::Resources);
    }

    pub fn register_resource_template(
        &self,
        template: ResourceTemplate,
        handler: ResourceHandler,
    ) -> Result<(), TemplateError> {
        let matcher = compile_uri_template(&template.uri_template)?;
        let pattern = template.uri_template.clone();
        if self
            .registry
            .write()
            .insert_template(template, matcher, handler)
        {
            debug!(template = %pattern, "replaced existing resource template");
        }
        self.notify_list_changed(ListKind::Resources);
        Ok(())
    }

    pub fn register_prompt(&self, prompt: Prompt, handler: PromptHandler) {
        let name = prompt.name.clone();
        if self.registry.write().insert_prompt(prompt, handler) {
            debug!(prompt = %name, "replaced existing prompt registration");
        }
        self.notify_list_changed(ListKind::Prompts);
    }

    pub fn register_notification_handler(
        &self,
        method: impl Into<String>,
        handler: NotificationHandler,
    ) {
        let method = method.into();
        if self
            .notification_handlers
            .write()
            .insert(method.clone(), handler)
            .is_some()
        {
            debug!(method = %method, "replaced existing notification handler");
        }
    }

    /// Sends a notification to every connection of every attached transport
    /// that can broadcast. Returns how many connections were reached.
    pub fn broadcast_notification(&self, method: &str, params: Value) -> usize {
        let message = notification_value(method, params);
        let transports: Vec<_> = {
            let mut attached = self.transports.lock();
            attached.retain(|transport| transport.strong_count() > 0);
            attached.iter().filter_map(Weak::upgrade).collect()
        };

        transports
            .iter()
            .filter(|transport| transport.capabilities().contains(Capability::Broadcast))
            .map(|transport| transport.broadcast_message(&message))
            .sum()
    }

    /// Watchers always hear about the change. Clients only do once initialized;
    /// before that they have not seen any list yet.
    pub fn notify_list_changed(&self, kind: ListKind) {
        let watchers = self.list_watchers.lock().clone();
        for watcher in watchers {
            watcher(kind);
        }

        if !self.is_initialized() {
            return;
        }
        let reached = self.broadcast_notification(kind.notification_method(), json!({}));
        debug!(list = ?kind, reached, "list change announced");
    }

    pub fn capabilities_for(&self, catalog: &dyn Catalog) -> ServerCapabilities {
        let changed = || ListChangedCapability { list_changed: true };
        let has_resources =
            !catalog.list_resources().is_empty() || !catalog.list_resource_templates().is_empty();

        ServerCapabilities {
            tools: (!catalog.list_tools().is_empty()).then(changed),
            resources: has_resources.then(|| ResourcesCapability {
                subscribe: false,
                list_changed: true,
            }),
            prompts: (!catalog.list_prompts().is_empty()).then(changed),
            logging: Some(Map::new()),
        }
    }

    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.session.get().map(|session| &session.capabilities)
    }

    fn initialize(&self, catalog: &dyn Catalog, params: Option<&Value>) -> Result<Value, ServerError> {
        let protocol_version = negotiate_protocol_version(params)?;
        let client = params
            .and_then(|params| params.get("clientInfo"))
            .cloned()
            .unwrap_or(Value::Null);

        let session = self.session.get_or_init(|| {
            let capabilities = self.capabilities_for(catalog);
            info!(
                protocol_version = %protocol_version,
                client = %client,
                capabilities = ?capabilities,
                "mcp session initialized"
            );
            InitializeResult {
                protocol_version,
                server_info: self.info.clone(),
                capabilities,
                instructions: self.instructions.clone(),
            }
        });

        Ok(serde_json::to_value(session).expect("initialize result serialization"))
    }

    /// Runs one request against `catalog`, tracking it for cancellation and
    /// emitting the audit line.
    pub fn respond(&self, catalog: &dyn Catalog, request: Request, ctx: RequestContext) -> Response {
        let Request { id, method, params } = request;
        let audit_params = audit::redact_audit_params(params.as_ref());
        let _in_flight = self.track(&id, &ctx);

        let response = match self.route(catalog, &method, params, &ctx) {
            Ok(result) => Response::success(id, result),
            Err(err) => {
                log_dispatch_failure(&method, &err);
                Response::failure(Some(id), err.to_rpc_error())
            }
        };

        info!(
            method = %method,
            params = %audit_params,
            outcome = if response.is_error() { "failure" } else { "success" },
            "mcp action audited"
        );

        response
    }

    fn route(
        &self,
        catalog: &dyn Catalog,
        method: &str,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<Value, ServerError> {
        if method == "initialize" {
            return self.initialize(catalog, params.as_ref());
        }
        if !self.is_initialized() {
            return Err(ServerError::NotInitialized);
        }
        // cancelled while still queued
        ctx.ensure_not_cancelled()?;

        match method {
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": catalog.list_tools() })),
            "tools/call" => {
                let params: CallToolParams = parse_params(params)?;
                let result = catalog.call_tool(&params.name, params.arguments, ctx)?;
                Ok(serde_json::to_value(result).expect("tool result serialization"))
            }
            "resources/list" => Ok(json!({ "resources": catalog.list_resources() })),
            "resources/templates/list" => {
                Ok(json!({ "resourceTemplates": catalog.list_resource_templates() }))
            }
            "resources/read" => {
                let params: ReadResourceParams = parse_params(params)?;
                let contents = catalog.read_resource(&params.uri, ctx)?;
                Ok(json!({ "contents": [contents] }))
            }
            "prompts/list" => Ok(json!({ "prompts": catalog.list_prompts() })),
            "prompts/get" => {
                let params: GetPromptParams = parse_params(params)?;
                let result = catalog.get_prompt(&params.name, params.arguments, ctx)?;
                Ok(serde_json::to_value(result).expect("prompt result serialization"))
            }
            other => Err(ServerError::MethodNotFound(other.to_string())),
        }
    }

    /// Handles a client notification. Never produces a response.
    pub fn notify(&self, notification: Notification, ctx: RequestContext) {
        let Notification { method, params } = notification;

        if matches!(method.as_str(), "initialized" | "notifications/initialized") {
            if self.is_initialized() {
                info!("client acknowledged initialization");
            } else {
                warn!(
                    code = SERVER_NOT_INITIALIZED,
                    "initialized notification arrived before initialize"
                );
            }
            return;
        }

        if !self.is_initialized() {
            debug!(
                method = %method,
                code = SERVER_NOT_INITIALIZED,
                "ignoring notification before initialization"
            );
            return;
        }

        if method == "notifications/cancelled" {
            self.cancel_in_flight(params, &ctx);
            return;
        }

        let handler = self.notification_handlers.read().get(&method).cloned();
        match handler {
            Some(handler) => {
                if let Err(message) = guarded(|| handler.invoke(&ctx, params)) {
                    warn!(method = %method, error = %message, "notification handler failed");
                }
            }
            None => debug!(method = %method, "no handler registered for notification"),
        }
    }

    fn track(&self, id: &RequestId, ctx: &RequestContext) -> Option<InFlightGuard<'_>> {
        let key = InFlightKey::new(ctx, id.clone());
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(&key) {
            // the earlier call keeps its slot and stays cancellable
            warn!(request_id = %id, "request id reused while still in flight");
            return None;
        }
        in_flight.insert(key.clone(), ctx.cancellation_token());
        Some(InFlightGuard {
            in_flight: &self.in_flight,
            key,
        })
    }

    fn cancel_in_flight(&self, params: Option<Value>, ctx: &RequestContext) {
        let params: CancelledParams = match parse_params(params) {
            Ok(params) => params,
            Err(err) => {
                debug!(error = %err, "malformed cancellation notification");
                return;
            }
        };
        let Some(id) = RequestId::from_value(&params.request_id) else {
            debug!(request_id = %params.request_id, "cancellation for unusable request id");
            return;
        };

        match self.in_flight.lock().get(&InFlightKey::new(ctx, id.clone())) {
            Some(token) => {
                token.cancel();
                info!(request_id = %id, reason = ?params.reason, "request cancelled by client");
            }
            None => debug!(request_id = %id, "cancellation for request not in flight"),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

impl Catalog for McpServer {
    fn list_tools(&self) -> Vec<Tool> {
        self.registry
            .read()
            .tools
            .values()
            .map(|entry| entry.tool.clone())
            .collect()
    }

    fn has_tool(&self, name: &str) -> bool {
        self.registry.read().tools.contains_key(name)
    }

    fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<CallToolResult, ServerError> {
        let entry = self
            .registry
            .read()
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| ServerError::not_found("tool", name))?;

        let arguments = into_arguments(arguments)?;
        let missing = missing_arguments(entry.tool.required_arguments(), &arguments);
        if !missing.is_empty() {
            return Err(ServerError::invalid_params_with(
                format!("missing required arguments: {}", missing.join(", ")),
                json!({ "code": "missing_arguments", "tool": name, "missing": missing }),
            ));
        }

        match guarded(|| entry.handler.invoke(ctx, arguments)) {
            Ok(result) => Ok(result),
            Err(message) => {
                warn!(tool = %name, error = %message, "tool handler failed");
                Ok(CallToolResult::error(message))
            }
        }
    }

    fn list_resources(&self) -> Vec<Resource> {
        self.registry
            .read()
            .resources
            .values()
            .map(|entry| entry.resource.clone())
            .collect()
    }

    fn list_resource_templates(&self) -> Vec<ResourceTemplate> {
        self.registry
            .read()
            .templates
            .iter()
            .map(|entry| entry.template.clone())
            .collect()
    }

    fn read_resource(
        &self,
        uri: &str,
        ctx: &RequestContext,
    ) -> Result<ResourceContents, ServerError> {
        let (handler, request) = self
            .registry
            .read()
            .resolve_resource(uri)
            .ok_or_else(|| ServerError::not_found("resource", uri))?;

        guarded(|| handler.invoke(ctx, request)).map_err(|message| {
            warn!(uri = %uri, error = %message, "resource handler failed");
            ServerError::Handler(message)
        })
    }

    fn list_prompts(&self) -> Vec<Prompt> {
        self.registry
            .read()
            .prompts
            .values()
            .map(|entry| entry.prompt.clone())
            .collect()
    }

    fn has_prompt(&self, name: &str) -> bool {
        self.registry.read().prompts.contains_key(name)
    }

    fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<GetPromptResult, ServerError> {
        let entry = self
            .registry
            .read()
            .prompts
            .get(name)
            .cloned()
            .ok_or_else(|| ServerError::not_found("prompt", name))?;

        let arguments = into_arguments(arguments)?;
        let required = entry
            .prompt
            .arguments
            .iter()
            .filter(|argument| argument.required)
            .map(|argument| argument.name.as_str())
            .collect();
        let missing = missing_arguments(required, &arguments);
        if !missing.is_empty() {
            return Err(ServerError::invalid_params_with(
                format!("missing required arguments: {}", missing.join(", ")),
                json!({ "code": "missing_arguments", "prompt": name, "missing": missing }),
            ));
        }

        guarded(|| entry.handler.invoke(ctx, arguments)).map_err(|message| {
            warn!(prompt = %name, error = %message, "prompt handler failed");
            ServerError::Handler(message)
        })
    }

    fn watch_list_changes(&self, listener: ListChangeListener) {
        self.list_watchers.lock().push(listener);
    }
}

impl Dispatch for McpServer {
    fn info(&self) -> &ServerInfo {
        &self.info
    }

    fn is_initialized(&self) -> bool {
        self.session.get().is_some()
    }

    fn handle_request(&self, request: Request, ctx: RequestContext) -> Response {
        self.respond(self, request, ctx)
    }

    fn handle_notification(&self, notification: Notification, ctx: RequestContext) {
        self.notify(notification, ctx);
    }

    fn attach_transport(&self, transport: Weak<dyn Transport>) {
        let mut attached = self.transports.lock();
        attached.retain(|existing| existing.strong_count() > 0);
        attached.push(transport);
    }
}

struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<InFlightKey, CancellationToken>>,
    key: InFlightKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// Routes one decoded message. Requests always yield a response; notifications
/// and stray client responses never do.
pub fn process_message(
    server: &dyn Dispatch,
    message: Message,
    transport: Option<TransportHandle>,
) -> Option<Response> {
    match message {
        Message::Request(request) => {
            let ctx = RequestContext::for_request(&request, transport);
            Some(server.handle_request(request, ctx))
        }
        Message::Notification(notification) => {
            server.handle_notification(notification, RequestContext::for_notification(transport));
            None
        }
        Message::Response(response) => {
            debug!(id = ?response.id, "ignoring client response with no pending server request");
            None
        }
    }
}

/// Decodes, dispatches and re-encodes one raw JSON-RPC document.
pub fn process_raw(
    server: &dyn Dispatch,
    raw: &str,
    transport: Option<TransportHandle>,
) -> Option<String> {
    match codec::decode(raw) {
        Ok(message) => process_message(server, message, transport)
            .map(|response| codec::encode_response(&response)),
        Err(err) if err.notification => {
            warn!(error = %err.error, "dropping malformed notification");
            None
        }
        Err(err) => {
            warn!(error = %err.error, "rejecting malformed message");
            Some(codec::encode_response(&err.into_response()))
        }
    }
}

pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<String, ServerError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| {
            ServerError::invalid_params_with(
                "initialize params.protocolVersion is required",
                json!({ "code": "invalid_protocol_version" }),
            )
        })?;

    if SUPPORTED_PROTOCOL_VERSIONS.contains(&offered_version) {
        Ok(offered_version.to_string())
    } else {
        debug!(offered = %offered_version, answered = LATEST_PROTOCOL_VERSION, "client offered unsupported protocol version");
        Ok(LATEST_PROTOCOL_VERSION.to_string())
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ServerError> {
    let params = params.unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::from_value(params).map_err(|err| {
        ServerError::invalid_params_with("Invalid params", json!({ "details": err.to_string() }))
    })
}

fn into_arguments(arguments: Option<Value>) -> Result<Map<String, Value>, ServerError> {
    match arguments {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(arguments)) => Ok(arguments),
        Some(_) => Err(ServerError::invalid_params("arguments must be an object")),
    }
}

fn missing_arguments(required: Vec<&str>, arguments: &Map<String, Value>) -> Vec<String> {
    required
        .into_iter()
        .filter(|name| !arguments.contains_key(*name))
        .map(str::to_string)
        .collect()
}

/// Runs a handler, folding both returned errors and panics into a message.
fn guarded<T>(handler: impl FnOnce() -> HandlerResult<T>) -> Result<T, String> {
    match catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn log_dispatch_failure(method: &str, err: &ServerError) {
    let context = Value::Object(err.context());
    match err.severity() {
        Severity::Info => debug!(method = %method, code = err.code(), error = %err, context = %context, "request rejected"),
        Severity::Warning => warn!(method = %method, code = err.code(), error = %err, context = %context, "request rejected"),
        Severity::Error => error!(method = %method, code = err.code(), error = %err, context = %context, "request failed"),
    }
}
