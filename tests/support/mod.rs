//! In-process RPC test server speaking the binary wire format.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use meshcall::protocol::{DEFAULT_MAX_MESSAGE_SIZE, Message, MessageStatus, MessageType};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// Connection and request counters for assertions.
#[derive(Default)]
pub struct ServerStats {
    pub accepted: AtomicUsize,
    pub requests: AtomicUsize,
}

/// Spawn an arithmetic echo server on an ephemeral port.
pub async fn spawn_arith_server() -> (String, Arc<ServerStats>) {
    spawn_arith_server_with_delay(Duration::ZERO).await
}

/// Spawn the server with a fixed extra delay before every response.
pub async fn spawn_arith_server_with_delay(delay: Duration) -> (String, Arc<ServerStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let stats = Arc::new(ServerStats::default());

    let conn_stats = Arc::clone(&stats);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            conn_stats.accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_conn(stream, Arc::clone(&conn_stats), delay));
        }
    });

    (addr, stats)
}

async fn serve_conn(stream: TcpStream, stats: Arc<ServerStats>, delay: Duration) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    loop {
        let mut req = Message::new();
        if req
            .read_from(&mut reader, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .is_err()
        {
            return;
        }
        stats.requests.fetch_add(1, Ordering::SeqCst);
        if req.header.is_oneway() {
            continue;
        }
        if req.service_method == "Hangup" {
            // Simulate a server dying mid-call.
            return;
        }

        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let resp = respond(&req);
            let extra = req
                .metadata
                .get("delay_ms")
                .and_then(|ms| ms.parse::<u64>().ok())
                .map_or(Duration::ZERO, Duration::from_millis);
            if !(delay + extra).is_zero() {
                tokio::time::sleep(delay + extra).await;
            }
            let bytes = resp.encode().expect("encode response");
            let mut writer = writer.lock().await;
            let _ = writer.write_all(&bytes).await;
        });
    }
}

fn respond(req: &Message) -> Message {
    let mut resp = Message::new();
    resp.header = req.header;
    resp.header.set_message_type(MessageType::Response);
    resp.header.set_message_status(MessageStatus::Normal);
    resp.service_path = req.service_path.clone();
    resp.service_method = req.service_method.clone();

    if req.header.is_heartbeat() {
        return resp;
    }

    match req.service_method.as_str() {
        "Mul" => match rmp_serde::from_slice::<Vec<u64>>(&req.payload) {
            Ok(factors) => {
                let product: u64 = factors.iter().product();
                resp.payload = rmp_serde::to_vec(&product).expect("encode product");
            }
            Err(err) => {
                resp.header.set_message_status(MessageStatus::Error);
                resp.set_service_error(format!("bad args: {err}"));
            }
        },
        "Echo" | "Slow" => {
            resp.payload = req.payload.clone();
        }
        other => {
            resp.header.set_message_status(MessageStatus::Error);
            resp.set_service_error(format!("unknown method {other}"));
        }
    }
    resp
}
