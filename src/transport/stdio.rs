//! Line-delimited JSON-RPC over the process's stdin and stdout
//!
//! One reader thread preserves line framing. `initialize` and notifications
//! are handled inline so state changes and cancellations apply in arrival
//! order; every other request runs on the [`WorkerPool`], so responses may be
//! written out of submission order. A single write lock keeps each line whole.

use std::{
    io::{self, BufRead, Write},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    pool::WorkerPool,
    protocol::{
        codec::{self, notification_value},
        error::RpcError,
        Message, Response,
    },
    server::{process_message, Dispatch, TransportHandle},
    transport::{
        deliver, event_frame, unicast, Capability, CapabilitySet, Connection, ConnectionId,
        ConnectionPool, Outbound, OutboundChannel, Transport, TransportError, TransportKind,
    },
};

const CAPABILITIES: CapabilitySet = CapabilitySet::of(&[
    Capability::Broadcast,
    Capability::Events,
    Capability::Unicast,
    Capability::Bidirectional,
]);

/// Serialized line output shared by the reader thread and all workers.
#[derive(Clone)]
pub struct LineWriter(Arc<Mutex<Box<dyn Write + Send>>>);

impl LineWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }

    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut out = self.0.lock();
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()
    }

    fn write_response(&self, response: &Response) -> io::Result<()> {
        self.write_line(&codec::encode_response(response))
    }
}

impl OutboundChannel for LineWriter {
    fn deliver(&self, frame: Outbound) -> bool {
        let line = match frame {
            Outbound::Message(line) => line,
            // no event framing on a pipe; events travel as notifications
            Outbound::Event { event, data } => notification_value(&event, data).to_string(),
        };
        match self.write_line(&line) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "stdout write failed");
                false
            }
        }
    }
}

pub struct StdioTransport {
    workers: WorkerPool,
    connections: ConnectionPool<LineWriter>,
    writer: LineWriter,
}

impl StdioTransport {
    pub fn new(worker_threads: usize) -> Result<Self, TransportError> {
        Self::with_writer(Box::new(io::stdout()), worker_threads)
    }

    pub fn with_writer(
        writer: Box<dyn Write + Send>,
        worker_threads: usize,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            workers: WorkerPool::new(worker_threads)?,
            connections: ConnectionPool::new(),
            writer: LineWriter::new(writer),
        })
    }

    pub fn worker_threads(&self) -> usize {
        self.workers.size()
    }

    /// Reads requests until `reader` reaches end of input, then waits for
    /// every in-flight request to finish writing its response. A line that is
    /// not utf-8 is answered with a parse error; only i/o failures stop it.
    pub fn run<R: BufRead>(
        self: &Arc<Self>,
        reader: R,
        server: Arc<dyn Dispatch>,
    ) -> Result<(), TransportError> {
        let transport: Arc<dyn Transport> = self.clone();
        server.attach_transport(Arc::downgrade(&transport));
        let connection = self
            .connections
            .add(Connection::new(self.writer.clone(), true));
        let handle = TransportHandle::new(&transport, Some(connection));
        drop(transport);

        info!(
            server = %server.info().name,
            workers = self.workers.size(),
            "stdio transport reading"
        );

        let outcome = self.read_loop(reader, &server, &handle);
        self.workers.wait_idle();
        self.connections.remove(connection);
        info!("stdio transport stopped");
        outcome
    }

    fn read_loop<R: BufRead>(
        &self,
        mut reader: R,
        server: &Arc<dyn Dispatch>,
        handle: &TransportHandle,
    ) -> Result<(), TransportError> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "rejecting line that is not utf-8");
                    let error = RpcError::parse_error(format!("invalid utf-8: {err}"));
                    self.writer.write_response(&Response::failure(None, error))?;
                    continue;
                }
            };
            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }

            let message = match codec::decode(raw) {
                Ok(message) => message,
                Err(err) if err.notification => {
                    warn!(error = %err.error, "dropping malformed notification");
                    continue;
                }
                Err(err) => {
                    warn!(error = %err.error, "rejecting malformed message");
                    self.writer.write_response(&err.into_response())?;
                    continue;
                }
            };

            match message {
                Message::Request(request) if request.method != "initialize" => {
                    let server = server.clone();
                    let handle = handle.clone();
                    let writer = self.writer.clone();
                    self.workers.execute(move || {
                        let message = Message::Request(request);
                        if let Some(response) = process_message(server.as_ref(), message, Some(handle)) {
                            if let Err(err) = writer.write_response(&response) {
                                warn!(error = %err, "failed to write response");
                            }
                        }
                    })?;
                }
                inline => {
                    if let Some(response) =
                        process_message(server.as_ref(), inline, Some(handle.clone()))
                    {
                        self.writer.write_response(&response)?;
                    }
                }
            }
        }

        debug!("stdin reached end of input");
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn capabilities(&self) -> CapabilitySet {
        CAPABILITIES
    }

    fn broadcast_message(&self, message: &Value) -> usize {
        self.connections
            .deliver_all(&Outbound::Message(message.to_string()))
    }

    fn send_to(&self, connection: ConnectionId, message: &Value) -> Result<(), TransportError> {
        unicast(
            &self.connections,
            connection,
            Outbound::Message(message.to_string()),
        )
    }

    fn send_event(
        &self,
        event: &str,
        data: &Value,
        target: Option<ConnectionId>,
    ) -> Result<usize, TransportError> {
        deliver(&self.connections, event_frame(event, data), target)
    }

    async fn serve(self: Arc<Self>, server: Arc<dyn Dispatch>) -> Result<(), TransportError> {
        tokio::task::spawn_blocking(move || {
            let stdin = io::stdin();
            self.run(stdin.lock(), server)
        })
        .await
        .map_err(|err| TransportError::Io(io::Error::other(err)))?
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        thread,
        time::{Duration, Instant},
    };

    use serde_json::json;

    use super::*;
    use crate::{
        protocol::types::{CallToolResult, Tool},
        server::{McpServer, ToolHandler},
    };

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn lines(&self) -> Vec<Value> {
            let bytes = self.0.lock().clone();
            String::from_utf8(bytes)
                .expect("utf8 output")
                .lines()
                .map(|line| serde_json::from_str(line).expect("every line is one json document"))
                .collect()
        }
    }

    fn server() -> Arc<McpServer> {
        let server = McpServer::new("stdio-test", "0.1.0");
        server.register_tool(
            Tool::new("sleep"),
            ToolHandler::plain(|_| {
                thread::sleep(Duration::from_millis(100));
                Ok(CallToolResult::text("done"))
            }),
        );
        server.register_tool(
            Tool::new("progress"),
            ToolHandler::contextual(|ctx, _| {
                ctx.report_progress("half", 0.5);
                Ok(CallToolResult::text("done"))
            }),
        );
        Arc::new(server)
    }

    fn line(value: Value) -> String {
        format!("{value}\n")
    }

    fn run(input: String, workers: usize) -> (SharedBuffer, Duration) {
        let output = SharedBuffer::default();
        let transport = Arc::new(
            StdioTransport::with_writer(Box::new(output.clone()), workers).expect("transport"),
        );
        let started = Instant::now();
        transport
            .run(input.as_bytes(), server())
            .expect("stdio run completes");
        (output, started.elapsed())
    }

    fn initialize() -> String {
        line(json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {"protocolVersion": "2025-06-18", "capabilities": {}}
        })) + &line(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
    }

    #[test]
    fn concurrent_requests_overlap_on_the_pool() {
        let mut input = initialize();
        for id in 1..=8 {
            input += &line(json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "tools/call",
                "params": {"name": "sleep"}
            }));
        }

        let (output, elapsed) = run(input, 4);

        assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
        let lines = output.lines();
        assert_eq!(lines.len(), 9);
        let ids: BTreeSet<i64> = lines
            .iter()
            .filter_map(|line| line["id"].as_i64())
            .collect();
        assert_eq!(ids, (0..=8).collect());
        assert!(lines[1..]
            .iter()
            .all(|line| line["result"]["content"][0]["text"] == "done"));
    }

    #[test]
    fn malformed_lines_get_error_responses() {
        let input = String::from("{oops\n\n")
            + &line(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}));

        let (output, _) = run(input, 1);

        let lines = output.lines();
        assert_eq!(lines.len(), 2);
        let codes: BTreeSet<i64> = lines
            .iter()
            .filter_map(|line| line["error"]["code"].as_i64())
            .collect();
        assert_eq!(codes, BTreeSet::from([-32700, -32002]));
    }

    #[test]
    fn invalid_utf8_line_is_rejected_and_reading_continues() {
        let mut input = vec![0xff, 0xfe, b'\n'];
        input.extend_from_slice(
            line(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "initialize",
                "params": {"protocolVersion": "2025-06-18", "capabilities": {}}
            }))
            .as_bytes(),
        );
        let output = SharedBuffer::default();
        let transport = Arc::new(
            StdioTransport::with_writer(Box::new(output.clone()), 1).expect("transport"),
        );

        transport
            .run(input.as_slice(), server())
            .expect("stdio run completes");

        let lines = output.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["error"]["code"], -32700);
        assert_eq!(lines[0]["id"], Value::Null);
        assert_eq!(lines[1]["id"], 2);
        assert!(lines[1]["result"]["protocolVersion"].is_string());
    }

    #[test]
    fn progress_notifications_share_the_output_stream() {
        let input = initialize()
            + &line(json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": {"name": "progress", "_meta": {"progressToken": 11}}
            }));

        let (output, _) = run(input, 2);

        let lines = output.lines();
        let progress = lines
            .iter()
            .find(|line| line["method"] == "notifications/progress")
            .expect("progress notification");
        assert_eq!(progress["params"]["progressToken"], 11);
        assert!(lines.iter().any(|line| line["id"] == 5));
    }
}
