//! Sample catalog served by the binary
//!
//! A composed server with a few tools, a static resource, a resource template
//! and a prompt, plus a text-utilities server mounted under the `text_` prefix.

use std::{sync::Arc, thread, time::Duration};

use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    compose::ComposedServer,
    protocol::{
        types::{
            CallToolResult, GetPromptResult, Prompt, PromptArgument, PromptMessage, Resource,
            ResourceContents, ResourceTemplate, Tool,
        },
        LATEST_PROTOCOL_VERSION,
    },
    server::{
        HandlerResult, McpServer, PromptHandler, ResourceHandler, ToolHandler,
    },
    template::TemplateError,
};

pub const MAX_COUNT: u64 = 100;
const COUNT_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Deserialize)]
struct EchoParams {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AddParams {
    a: f64,
    b: f64,
}

#[derive(Debug, Deserialize)]
struct CountParams {
    to: u64,
}

fn parse<T: serde::de::DeserializeOwned>(arguments: Map<String, Value>) -> HandlerResult<T> {
    Ok(serde_json::from_value(Value::Object(arguments))?)
}

pub fn demo_server() -> Result<ComposedServer, TemplateError> {
    let core = McpServer::new("mcp-runtime-demo", env!("CARGO_PKG_VERSION"))
        .with_instructions("Demo catalog: echo, add and count tools plus text_* utilities.");

    core.register_tool(
        Tool::new("echo")
            .with_description("Echo the given text back")
            .with_input_schema(json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })),
        ToolHandler::plain(|arguments| {
            let params: EchoParams = parse(arguments)?;
            Ok(CallToolResult::text(format!("Echo: {}", params.text)))
        }),
    );

    core.register_tool(
        Tool::new("add")
            .with_description("Add two numbers")
            .with_input_schema(json!({
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"]
            }))
            .with_output_schema(json!({
                "type": "object",
                "properties": {"sum": {"type": "number"}}
            })),
        ToolHandler::plain(|arguments| {
            let params: AddParams = parse(arguments)?;
            let sum = params.a + params.b;
            Ok(CallToolResult::structured(sum.to_string(), json!({ "sum": sum })))
        }),
    );

    core.register_tool(
        Tool::new("count")
            .with_description("Count slowly up to `to`, reporting progress")
            .with_input_schema(json!({
                "type": "object",
                "properties": {"to": {"type": "integer", "minimum": 1, "maximum": MAX_COUNT}},
                "required": ["to"]
            })),
        ToolHandler::contextual(|ctx, arguments| {
            let params: CountParams = parse(arguments)?;
            if params.to == 0 || params.to > MAX_COUNT {
                return Err(format!("`to` must be between 1 and {MAX_COUNT}").into());
            }
            for step in 1..=params.to {
                ctx.ensure_not_cancelled()?;
                thread::sleep(COUNT_STEP);
                ctx.report_progress(&format!("{step}/{}", params.to), step as f64 / params.to as f64);
            }
            Ok(CallToolResult::text(params.to.to_string()))
        }),
    );

    core.register_resource(
        Resource::new("runtime://info", "runtime-info")
            .with_description("Server name, protocol version and current time")
            .with_mime_type("application/json"),
        ResourceHandler::plain(|request| {
            let info = json!({
                "name": "mcp-runtime-demo",
                "protocolVersion": LATEST_PROTOCOL_VERSION,
                "timeUtc": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            });
            Ok(ResourceContents::json(request.uri, &info))
        }),
    );

    core.register_resource_template(
        ResourceTemplate::new("greeting://{name}", "greeting")
            .with_description("A greeting for the named person")
            .with_mime_type("text/plain"),
        ResourceHandler::plain(|request| {
            let name = request.param("name").unwrap_or("stranger").to_string();
            Ok(ResourceContents::text(request.uri, format!("Hello, {name}!")))
        }),
    )?;

    core.register_prompt(
        Prompt::new("summarize")
            .with_description("Ask for a summary of a topic")
            .with_argument(PromptArgument::required("topic"))
            .with_argument(PromptArgument::optional("style")),
        PromptHandler::plain(|arguments| {
            let topic = arguments
                .get("topic")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let style = arguments
                .get("style")
                .and_then(Value::as_str)
                .unwrap_or("concise");
            Ok(GetPromptResult {
                description: Some(format!("Summary of {topic}")),
                messages: vec![PromptMessage::user(format!(
                    "Write a {style} summary of {topic}."
                ))],
            })
        }),
    );

    let composed = ComposedServer::from_server(core);
    composed.mount_server_at("/text", Arc::new(text_server()), Some("text_"));
    Ok(composed)
}

fn text_server() -> McpServer {
    let server = McpServer::new("text-utilities", env!("CARGO_PKG_VERSION"));
    let schema = json!({
        "type": "object",
        "properties": {"text": {"type": "string"}},
        "required": ["text"]
    });

    server.register_tool(
        Tool::new("upper")
            .with_description("Uppercase the given text")
            .with_input_schema(schema.clone()),
        ToolHandler::plain(|arguments| {
            let params: EchoParams = parse(arguments)?;
            Ok(CallToolResult::text(params.text.to_uppercase()))
        }),
    );
    server.register_tool(
        Tool::new("reverse")
            .with_description("Reverse the given text")
            .with_input_schema(schema),
        ToolHandler::plain(|arguments| {
            let params: EchoParams = parse(arguments)?;
            Ok(CallToolResult::text(params.text.chars().rev().collect::<String>()))
        }),
    );
    server
}
