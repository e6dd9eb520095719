//! Loopback TCP server
//!
//! Thin transport over the command surface: length-prefixed JSON frames
//! (4-byte little-endian length, then one `Request` object) over a
//! loopback-only listener. Multiple clients may be connected at once; each
//! connection gets its own task and every request is dispatched on the
//! blocking pool so a long scan never stalls the runtime.

use crate::commands;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use veil_common::{Error, Request, Response, Result};
use veil_core::MemoryEngine;

/// Frames above this size are rejected outright.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub struct AgentServer {
    engine: Arc<MemoryEngine>,
    running: Arc<AtomicBool>,
    clients: Arc<RwLock<HashMap<u64, SocketAddr>>>,
    next_client_id: AtomicU64,
}

impl AgentServer {
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self {
            engine,
            running: Arc::new(AtomicBool::new(true)),
            clients: Arc::new(RwLock::new(HashMap::new())),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Bind the loopback listener and serve until stopped.
    pub async fn run(&self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| Error::Transport(format!("bind failed on port {}: {}", port, e)))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (tests bind port 0 themselves).
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?;
        info!(target: "veil_agent::server", address = %local, "listening");

        while self.running.load(Ordering::SeqCst) {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(target: "veil_agent::server", error = %e, "accept failed");
                    continue;
                }
            };
            debug!(target: "veil_agent::server", peer = %peer, "client connected");

            if let Err(e) = stream.set_nodelay(true) {
                warn!(target: "veil_agent::server", error = %e, "failed to set TCP_NODELAY");
            }

            let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
            self.clients.write().insert(client_id, peer);

            let engine = Arc::clone(&self.engine);
            let running = Arc::clone(&self.running);
            let clients = Arc::clone(&self.clients);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, engine, running).await {
                    debug!(target: "veil_agent::server", peer = %peer, error = %e, "connection closed");
                }
                clients.write().remove(&client_id);
            });
        }

        info!(target: "veil_agent::server", "listener stopped");
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    engine: Arc<MemoryEngine>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    while running.load(Ordering::SeqCst) {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()), // clean disconnect
            Err(e) => return Err(e),
        };

        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => {
                let engine = Arc::clone(&engine);
                tokio::task::spawn_blocking(move || commands::dispatch(&engine, &request))
                    .await
                    .unwrap_or_else(|_| {
                        Response::fail(None, "Internal error while handling command")
                    })
            }
            Err(e) => Response::fail(None, format!("Invalid request: {}", e)),
        };

        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Transport(format!("length read failed: {}", e))),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::Transport(format!("frame too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::Transport(format!("body read failed: {}", e)))?;
    Ok(Some(body))
}

async fn write_frame(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let body = serde_json::to_vec(response)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(Error::Transport("response too large".into()));
    }

    stream
        .write_all(&(body.len() as u32).to_le_bytes())
        .await
        .map_err(|e| Error::Transport(format!("length write failed: {}", e)))?;
    stream
        .write_all(&body)
        .await
        .map_err(|e| Error::Transport(format!("body write failed: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn send_request(
        stream: &mut TcpStream,
        request: &serde_json::Value,
    ) -> Response {
        let body = serde_json::to_vec(request).unwrap();
        stream
            .write_all(&(body.len() as u32).to_le_bytes())
            .await
            .unwrap();
        stream.write_all(&body).await.unwrap();

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut reply = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        stream.read_exact(&mut reply).await.unwrap();
        serde_json::from_slice(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = AgentServer::new(Arc::new(MemoryEngine::new()));
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();

        let response =
            send_request(&mut stream, &json!({"command": "process.info", "id": "1"})).await;
        assert!(response.success);
        assert_eq!(response.id.as_deref(), Some("1"));
        let data = response.data.unwrap();
        assert_eq!(data["pid"], json!(std::process::id()));

        // A second request on the same connection still works.
        let response = send_request(&mut stream, &json!({"command": "module.list"})).await;
        assert!(response.success);
        assert!(data["memoryMetrics"]["total"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_malformed_json_yields_failure_envelope() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = AgentServer::new(Arc::new(MemoryEngine::new()));
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let garbage = b"not json at all";
        stream
            .write_all(&(garbage.len() as u32).to_le_bytes())
            .await
            .unwrap();
        stream.write_all(garbage).await.unwrap();

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut reply = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        stream.read_exact(&mut reply).await.unwrap();
        let response: Response = serde_json::from_slice(&reply).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("Invalid request"));
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = AgentServer::new(Arc::new(MemoryEngine::new()));
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&((MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes()))
            .await
            .unwrap();

        // The server closes the connection without replying.
        let mut buf = [0u8; 1];
        let read = stream.read(&mut buf).await.unwrap();
        assert_eq!(read, 0);
    }
}
