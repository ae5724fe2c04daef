//! Descriptor registries and the handler variant type
//!
//! Tools, resources and prompts are keyed uniquely by name or uri and listed in
//! key order; re-registering a key replaces the previous entry. Resource
//! templates keep registration order because it decides match precedence.

use std::{collections::BTreeMap, collections::HashMap, fmt, sync::Arc};

use serde_json::{Map, Value};

use crate::{
    protocol::types::{
        CallToolResult, GetPromptResult, Prompt, Resource, ResourceContents, ResourceTemplate,
        Tool,
    },
    server::context::RequestContext,
    template::UriTemplate,
};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult<T> = Result<T, HandlerError>;

type PlainFn<A, T> = dyn Fn(A) -> HandlerResult<T> + Send + Sync;
type ContextualFn<A, T> = dyn Fn(&RequestContext, A) -> HandlerResult<T> + Send + Sync;

/// A handler either ignores the request context or receives it; the shape is
/// fixed when the handler is constructed.
pub enum Handler<A, T> {
    Plain(Arc<PlainFn<A, T>>),
    Contextual(Arc<ContextualFn<A, T>>),
}

impl<A, T> Clone for Handler<A, T> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(handler) => Self::Plain(handler.clone()),
            Self::Contextual(handler) => Self::Contextual(handler.clone()),
        }
    }
}

impl<A, T> fmt::Debug for Handler<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("Handler::Plain"),
            Self::Contextual(_) => f.write_str("Handler::Contextual"),
        }
    }
}

impl<A, T> Handler<A, T> {
    pub fn plain<F>(handler: F) -> Self
    where
        F: Fn(A) -> HandlerResult<T> + Send + Sync + 'static,
    {
        Self::Plain(Arc::new(handler))
    }

    pub fn contextual<F>(handler: F) -> Self
    where
        F: Fn(&RequestContext, A) -> HandlerResult<T> + Send + Sync + 'static,
    {
        Self::Contextual(Arc::new(handler))
    }

    pub fn invoke(&self, ctx: &RequestContext, args: A) -> HandlerResult<T> {
        match self {
            Self::Plain(handler) => handler(args),
            Self::Contextual(handler) => handler(ctx, args),
        }
    }
}

/// What a resource handler is asked to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub uri: String,
    /// Parameters bound by a resource template; empty for exact-uri resources.
    pub params: HashMap<String, String>,
}

impl ResourceRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

pub type ToolHandler = Handler<Map<String, Value>, CallToolResult>;
pub type ResourceHandler = Handler<ResourceRequest, ResourceContents>;
pub type PromptHandler = Handler<Map<String, Value>, GetPromptResult>;
pub type NotificationHandler = Handler<Option<Value>, ()>;

#[derive(Clone)]
pub(crate) struct ToolEntry {
    pub tool: Tool,
    pub handler: ToolHandler,
}

#[derive(Clone)]
pub(crate) struct ResourceEntry {
    pub resource: Resource,
    pub handler: ResourceHandler,
}

#[derive(Clone)]
pub(crate) struct TemplateEntry {
    pub template: ResourceTemplate,
    pub matcher: UriTemplate,
    pub handler: ResourceHandler,
}

#[derive(Clone)]
pub(crate) struct PromptEntry {
    pub prompt: Prompt,
    pub handler: PromptHandler,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub tools: BTreeMap<String, ToolEntry>,
    pub resources: BTreeMap<String, ResourceEntry>,
    pub templates: Vec<TemplateEntry>,
    pub prompts: BTreeMap<String, PromptEntry>,
}

impl Registry {
    /// Returns `true` when an existing tool was replaced.
    pub fn insert_tool(&mut self, tool: Tool, handler: ToolHandler) -> bool {
        self.tools
            .insert(tool.name.clone(), ToolEntry { tool, handler })
            .is_some()
    }

    pub fn insert_resource(&mut self, resource: Resource, handler: ResourceHandler) -> bool {
        self.resources
            .insert(resource.uri.clone(), ResourceEntry { resource, handler })
            .is_some()
    }

    /// Same pattern replaces in place and keeps its precedence slot.
    pub fn insert_template(
        &mut self,
        template: ResourceTemplate,
        matcher: UriTemplate,
        handler: ResourceHandler,
    ) -> bool {
        let entry = TemplateEntry {
            template,
            matcher,
            handler,
        };
        match self
            .templates
            .iter_mut()
            .find(|existing| existing.template.uri_template == entry.template.uri_template)
        {
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                self.templates.push(entry);
                false
            }
        }
    }

    pub fn insert_prompt(&mut self, prompt: Prompt, handler: PromptHandler) -> bool {
        self.prompts
            .insert(prompt.name.clone(), PromptEntry { prompt, handler })
            .is_some()
    }

    /// Exact uri first, then templates in registration order.
    pub fn resolve_resource(&self, uri: &str) -> Option<(ResourceHandler, ResourceRequest)> {
        if let Some(entry) = self.resources.get(uri) {
            return Some((
                entry.handler.clone(),
                ResourceRequest {
                    uri: uri.to_string(),
                    params: HashMap::new(),
                },
            ));
        }

        self.templates.iter().find_map(|entry| {
            entry.matcher.matches(uri).map(|params| {
                (
                    entry.handler.clone(),
                    ResourceRequest {
                        uri: uri.to_string(),
                        params,
                    },
                )
            })
        })
    }
}
