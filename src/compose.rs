//! Server composition through mounting
//!
//! A [`ComposedServer`] owns a regular [`McpServer`] for its own registrations
//! and forwards everything it cannot answer itself to mounted child catalogs.
//! A mount may carry a name prefix that is prepended to the child's tool and
//! prompt names; resource uris pass through unchanged. List changes inside a
//! mounted child are re-announced to the composed server's clients.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    protocol::{
        types::{
            CallToolResult, GetPromptResult, Prompt, Resource, ResourceContents,
            ResourceTemplate, ServerInfo, Tool,
        },
        Notification, Request, Response,
    },
    server::{
        Catalog, Dispatch, ListChangeListener, ListKind, McpServer, RequestContext, ServerError,
    },
    transport::Transport,
};

#[derive(Clone)]
pub struct MountPoint {
    path: String,
    prefix: Option<String>,
    server: Arc<dyn Catalog>,
    /// Cleared once the mount is replaced or removed; silences its watcher.
    live: Arc<AtomicBool>,
}

impl fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountPoint")
            .field("path", &self.path)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl MountPoint {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn server(&self) -> &Arc<dyn Catalog> {
        &self.server
    }

    /// Strips this mount's prefix; `None` when the name does not carry it.
    fn local_name<'a>(&self, name: &'a str) -> Option<&'a str> {
        match &self.prefix {
            Some(prefix) => name.strip_prefix(prefix.as_str()).filter(|rest| !rest.is_empty()),
            None => Some(name),
        }
    }

    fn public_name(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.to_string(),
        }
    }
}

pub struct ComposedServer {
    core: Arc<McpServer>,
    mounts: RwLock<Vec<MountPoint>>,
}

impl ComposedServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self::from_server(McpServer::new(name, version))
    }

    pub fn from_server(core: McpServer) -> Self {
        Self {
            core: Arc::new(core),
            mounts: RwLock::new(Vec::new()),
        }
    }

    /// The composed server's own registries.
    pub fn core(&self) -> &McpServer {
        &self.core
    }

    /// Mounting an already used path replaces that mount in place.
    pub fn mount_server_at(
        &self,
        path: impl Into<String>,
        server: Arc<dyn Catalog>,
        prefix: Option<&str>,
    ) {
        let mount = MountPoint {
            path: path.into(),
            prefix: prefix.filter(|prefix| !prefix.is_empty()).map(str::to_string),
            server,
            live: Arc::new(AtomicBool::new(true)),
        };
        info!(path = %mount.path, prefix = ?mount.prefix, "mounting server");
        mount.server.watch_list_changes(self.forward_list_changes(&mount));

        {
            let mut mounts = self.mounts.write();
            match mounts.iter_mut().find(|existing| existing.path == mount.path) {
                Some(existing) => {
                    existing.live.store(false, Ordering::Release);
                    *existing = mount;
                }
                None => mounts.push(mount),
            }
        }
        self.announce_all_lists();
    }

    pub fn unmount_server(&self, path: &str) -> bool {
        let removed = {
            let mut mounts = self.mounts.write();
            let before = mounts.len();
            mounts.retain(|mount| {
                let keep = mount.path != path;
                if !keep {
                    mount.live.store(false, Ordering::Release);
                }
                keep
            });
            mounts.len() != before
        };
        if removed {
            info!(path = %path, "unmounted server");
            self.announce_all_lists();
        }
        removed
    }

    pub fn mount_points(&self) -> Vec<MountPoint> {
        self.mounts.read().clone()
    }

    /// First mount, in mount order, whose prefix strips to a tool the child
    /// knows. Returns the mount and the child-local tool name.
    pub fn find_mount_point_for_tool(&self, name: &str) -> Option<(MountPoint, String)> {
        self.find_mount(name, |server, local| server.has_tool(local))
    }

    pub fn find_mount_point_for_prompt(&self, name: &str) -> Option<(MountPoint, String)> {
        self.find_mount(name, |server, local| server.has_prompt(local))
    }

    fn find_mount(
        &self,
        name: &str,
        knows: impl Fn(&dyn Catalog, &str) -> bool,
    ) -> Option<(MountPoint, String)> {
        self.mount_points().into_iter().find_map(|mount| {
            let local = mount.local_name(name)?.to_string();
            knows(mount.server.as_ref(), &local).then_some((mount, local))
        })
    }

    fn forward_list_changes(&self, mount: &MountPoint) -> ListChangeListener {
        let core = Arc::downgrade(&self.core);
        let live = mount.live.clone();
        let path = mount.path.clone();
        Arc::new(move |kind| {
            if !live.load(Ordering::Acquire) {
                return;
            }
            if let Some(core) = core.upgrade() {
                debug!(path = %path, list = ?kind, "mounted server list changed");
                core.notify_list_changed(kind);
            }
        })
    }

    fn announce_all_lists(&self) {
        for kind in [ListKind::Tools, ListKind::Resources, ListKind::Prompts] {
            self.core.notify_list_changed(kind);
        }
    }
}

/// Merges lists keyed by name; earlier entries shadow later ones.
fn merge_named<T>(items: impl IntoIterator<Item = T>, key: impl Fn(&T) -> String) -> Vec<T> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item)))
        .collect()
}

impl Catalog for ComposedServer {
    fn list_tools(&self) -> Vec<Tool> {
        let mounted = self.mount_points().into_iter().flat_map(|mount| {
            mount
                .server
                .list_tools()
                .into_iter()
                .map(move |mut tool| {
                    tool.name = mount.public_name(&tool.name);
                    tool
                })
                .collect::<Vec<_>>()
        });
        merge_named(self.core.list_tools().into_iter().chain(mounted), |tool| {
            tool.name.clone()
        })
    }

    fn has_tool(&self, name: &str) -> bool {
        self.core.has_tool(name) || self.find_mount_point_for_tool(name).is_some()
    }

    fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<CallToolResult, ServerError> {
        if self.core.has_tool(name) {
            return self.core.call_tool(name, arguments, ctx);
        }
        match self.find_mount_point_for_tool(name) {
            Some((mount, local)) => mount.server.call_tool(&local, arguments, ctx),
            None => Err(ServerError::not_found("tool", name)),
        }
    }

    fn list_resources(&self) -> Vec<Resource> {
        let mounted = self
            .mount_points()
            .into_iter()
            .flat_map(|mount| mount.server.list_resources());
        merge_named(self.core.list_resources().into_iter().chain(mounted), |resource| {
            resource.uri.clone()
        })
    }

    fn list_resource_templates(&self) -> Vec<ResourceTemplate> {
        let mounted = self
            .mount_points()
            .into_iter()
            .flat_map(|mount| mount.server.list_resource_templates());
        merge_named(
            self.core.list_resource_templates().into_iter().chain(mounted),
            |template| template.uri_template.clone(),
        )
    }

    fn read_resource(
        &self,
        uri: &str,
        ctx: &RequestContext,
    ) -> Result<ResourceContents, ServerError> {
        match self.core.read_resource(uri, ctx) {
            Err(ServerError::NotFound { .. }) => {}
            resolved => return resolved,
        }
        for mount in self.mount_points() {
            match mount.server.read_resource(uri, ctx) {
                Err(ServerError::NotFound { .. }) => continue,
                resolved => return resolved,
            }
        }
        Err(ServerError::not_found("resource", uri))
    }

    fn list_prompts(&self) -> Vec<Prompt> {
        let mounted = self.mount_points().into_iter().flat_map(|mount| {
            mount
                .server
                .list_prompts()
                .into_iter()
                .map(move |mut prompt| {
                    prompt.name = mount.public_name(&prompt.name);
                    prompt
                })
                .collect::<Vec<_>>()
        });
        merge_named(self.core.list_prompts().into_iter().chain(mounted), |prompt| {
            prompt.name.clone()
        })
    }

    fn has_prompt(&self, name: &str) -> bool {
        self.core.has_prompt(name) || self.find_mount_point_for_prompt(name).is_some()
    }

    fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<GetPromptResult, ServerError> {
        if self.core.has_prompt(name) {
            return self.core.get_prompt(name, arguments, ctx);
        }
        match self.find_mount_point_for_prompt(name) {
            Some((mount, local)) => mount.server.get_prompt(&local, arguments, ctx),
            None => Err(ServerError::not_found("prompt", name)),
        }
    }

    fn watch_list_changes(&self, listener: ListChangeListener) {
        self.core.watch_list_changes(listener);
    }
}

impl Dispatch for ComposedServer {
    fn info(&self) -> &ServerInfo {
        self.core.info()
    }

    fn is_initialized(&self) -> bool {
        self.core.is_initialized()
    }

    fn handle_request(&self, request: Request, ctx: RequestContext) -> Response {
        self.core.respond(self, request, ctx)
    }

    fn handle_notification(&self, notification: Notification, ctx: RequestContext) {
        self.core.notify(notification, ctx);
    }

    fn attach_transport(&self, transport: Weak<dyn Transport>) {
        self.core.attach_transport(transport);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::{
        protocol::RequestId,
        server::{ResourceHandler, ToolHandler},
        transport::{websocket::WebSocketTransport, Connection, Outbound},
    };

    fn calculator() -> Arc<McpServer> {
        let child = McpServer::new("calc", "1.0.0");
        child.register_tool(
            Tool::new("add").with_input_schema(json!({
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"]
            })),
            ToolHandler::plain(|arguments| {
                let a = arguments.get("a").and_then(Value::as_f64).unwrap_or_default();
                let b = arguments.get("b").and_then(Value::as_f64).unwrap_or_default();
                Ok(CallToolResult::text(format!("{}", a + b)))
            }),
        );
        Arc::new(child)
    }

    fn call(server: &dyn Dispatch, id: i64, method: &str, params: Value) -> Response {
        let request = Request {
            id: RequestId::Number(id),
            method: method.to_string(),
            params: Some(params),
        };
        let ctx = RequestContext::for_request(&request, None);
        server.handle_request(request, ctx)
    }

    fn initialize(server: &dyn Dispatch) {
        let response = call(server, 0, "initialize", json!({"protocolVersion": "2025-03-26"}));
        assert!(!response.is_error());
    }

    #[test]
    fn prefixed_tool_matches_direct_child_call() {
        let child = calculator();
        let composed = ComposedServer::new("gateway", "1.0.0");
        composed.mount_server_at("/calc", child.clone(), Some("calc_"));
        initialize(&composed);
        initialize(child.as_ref());

        let listed = call(&composed, 1, "tools/list", json!({}));
        assert_eq!(listed.result().expect("tools")["tools"][0]["name"], "calc_add");

        let arguments = json!({"a": 2, "b": 40});
        let via_mount = call(
            &composed,
            2,
            "tools/call",
            json!({"name": "calc_add", "arguments": arguments}),
        );
        let direct = call(
            child.as_ref(),
            2,
            "tools/call",
            json!({"name": "add", "arguments": arguments}),
        );

        assert_eq!(via_mount.result(), direct.result());
        assert_eq!(via_mount.result().expect("sum")["content"][0]["text"], "42");
    }

    #[test]
    fn first_registered_mount_wins_on_collision() {
        let composed = ComposedServer::new("gateway", "1.0.0");
        composed.mount_server_at("/one", calculator(), Some("x_"));
        composed.mount_server_at("/two", calculator(), Some("x_"));

        let (mount, local) = composed
            .find_mount_point_for_tool("x_add")
            .expect("mounted tool");

        assert_eq!(mount.path(), "/one");
        assert_eq!(local, "add");
        assert_eq!(composed.list_tools().len(), 1);
    }

    #[test]
    fn unmount_reports_whether_a_mount_existed() {
        let composed = ComposedServer::new("gateway", "1.0.0");
        composed.mount_server_at("/calc", calculator(), Some("calc_"));

        assert!(composed.unmount_server("/calc"));
        assert!(!composed.unmount_server("/calc"));
        assert!(composed.find_mount_point_for_tool("calc_add").is_none());
    }

    #[test]
    fn remounting_a_path_replaces_it() {
        let composed = ComposedServer::new("gateway", "1.0.0");
        composed.mount_server_at("/calc", calculator(), Some("old_"));
        composed.mount_server_at("/calc", calculator(), Some("new_"));

        assert_eq!(composed.mount_points().len(), 1);
        assert!(composed.has_tool("new_add"));
        assert!(!composed.has_tool("old_add"));
    }

    #[test]
    fn child_registrations_reach_composed_clients() {
        let child = calculator();
        let composed = ComposedServer::new("gateway", "1.0.0");
        composed.mount_server_at("/calc", child.clone(), Some("calc_"));
        let transport = Arc::new(WebSocketTransport::new(
            "127.0.0.1:0".parse().expect("socket addr"),
            "/ws",
        ));
        let (sender, mut receiver) = unbounded_channel();
        transport.connections().add(Connection::new(sender, true));
        let attached: Arc<dyn Transport> = transport.clone();
        composed.attach_transport(Arc::downgrade(&attached));
        initialize(&composed);

        child.register_tool(
            Tool::new("negate"),
            ToolHandler::plain(|_| Ok(CallToolResult::text("0"))),
        );

        let Ok(Outbound::Message(frame)) = receiver.try_recv() else {
            panic!("child registration was not announced");
        };
        let frame: Value = serde_json::from_str(&frame).expect("json frame");
        assert_eq!(frame["method"], "notifications/tools/list_changed");
        assert!(composed.has_tool("calc_negate"));

        composed.unmount_server("/calc");
        while receiver.try_recv().is_ok() {}
        child.register_tool(
            Tool::new("square"),
            ToolHandler::plain(|_| Ok(CallToolResult::text("0"))),
        );
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn resources_fall_through_to_mounts() {
        let child = McpServer::new("docs", "1.0.0");
        child
            .register_resource_template(
                ResourceTemplate::new("docs://{page}", "page"),
                ResourceHandler::plain(|request| {
                    let page = request.param("page").unwrap_or_default().to_string();
                    Ok(ResourceContents::text(request.uri, page))
                }),
            )
            .expect("template");
        let composed = ComposedServer::new("gateway", "1.0.0");
        composed.mount_server_at("/docs", Arc::new(child), None);
        initialize(&composed);

        let read = call(&composed, 1, "resources/read", json!({"uri": "docs://intro"}));
        let missing = call(&composed, 2, "resources/read", json!({"uri": "wiki://intro"}));

        assert_eq!(read.result().expect("contents")["contents"][0]["text"], "intro");
        assert_eq!(missing.error().map(|e| e.code), Some(-32602));
    }

    #[test]
    fn unprefixed_tool_without_match_is_not_found() {
        let composed = ComposedServer::new("gateway", "1.0.0");
        composed.mount_server_at("/calc", calculator(), Some("calc_"));
        initialize(&composed);

        let response = call(&composed, 1, "tools/call", json!({"name": "add"}));

        assert_eq!(response.error().map(|e| e.message.as_str()), Some("tool not found"));
    }
}
