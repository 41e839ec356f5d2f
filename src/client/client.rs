//! Connection-scoped call engine: one TCP stream, one reader task, one
//! pending table keyed by sequence number.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::protocol::{CompressType, Message, MessageStatus, MessageType};

use super::call::{CallFuture, CallTable, Reply};
use super::error::{ClientError, Result};
use super::options::{COMPRESS_THRESHOLD, ClientOptions};

/// A client bound to a single server connection.
///
/// Concurrency model: any number of caller tasks may issue
/// [`Client::call`]/[`Client::go`] concurrently; one background reader
/// task correlates responses to pending calls strictly by sequence
/// number, so completion order is unordered relative to issue order.
#[derive(Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
    reader: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
    remote_addr: String,
}

#[derive(Debug)]
struct ClientInner {
    opt: ClientOptions,
    table: Arc<Mutex<CallTable>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl Client {
    /// Dial `addr` (a `host:port` pair) and spawn the reader task.
    pub async fn connect(addr: &str, opt: ClientOptions) -> Result<Self> {
        let stream = tokio::time::timeout(opt.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout(opt.connect_timeout))??;
        stream.set_nodelay(true)?;
        debug!(%addr, "connected");

        let (read_half, write_half) = stream.into_split();
        let table = Arc::new(Mutex::new(CallTable::default()));
        let inner = Arc::new(ClientInner {
            opt: opt.clone(),
            table: Arc::clone(&table),
            writer: tokio::sync::Mutex::new(write_half),
        });

        let reader = tokio::spawn(read_loop(read_half, table, opt));

        let heartbeat = inner.opt.heartbeat_interval.map(|interval| {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if inner.is_closing() || inner.is_shutdown() {
                        return;
                    }
                    if let Err(err) = inner.heartbeat().await {
                        warn!(%err, "heartbeat failed");
                    }
                }
            })
        });

        Ok(Self {
            inner,
            reader,
            heartbeat,
            remote_addr: addr.to_owned(),
        })
    }

    /// Address this client dialed.
    #[must_use]
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Whether [`Client::close`] has been called.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.inner.is_closing()
    }

    /// Whether the connection has been torn down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    /// Issue a request asynchronously and return the in-flight handle.
    ///
    /// Any write failure resolves and removes the registration before
    /// returning, so no entry is ever left pending forever.
    pub async fn go<A, R>(
        &self,
        service_path: &str,
        service_method: &str,
        args: &A,
        metadata: HashMap<String, String>,
    ) -> Result<CallFuture<R>>
    where
        A: Serialize + ?Sized,
    {
        self.inner
            .issue(service_path, service_method, args, metadata)
            .await
    }

    /// Issue a request and wait for the decoded response.
    pub async fn call<A, R>(
        &self,
        service_path: &str,
        service_method: &str,
        args: &A,
        metadata: HashMap<String, String>,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.go(service_path, service_method, args, metadata)
            .await?
            .recv()
            .await
    }

    /// Issue a oneway request: the frame carries the oneway flag, no
    /// response is expected and the call resolves on a successful write.
    pub async fn notify<A>(
        &self,
        service_path: &str,
        service_method: &str,
        args: &A,
        metadata: HashMap<String, String>,
    ) -> Result<()>
    where
        A: Serialize + ?Sized,
    {
        let mut msg = self
            .inner
            .build_request(service_path, service_method, args, metadata)?;
        msg.header.set_oneway(true);
        if self.inner.is_closing() || self.inner.is_shutdown() {
            return Err(ClientError::Shutdown);
        }
        self.inner.write_frame(&msg).await
    }

    /// Send a heartbeat frame and wait for the echo.
    pub async fn heartbeat(&self) -> Result<()> {
        self.inner.heartbeat().await
    }

    /// Drain pending calls with [`ClientError::Shutdown`] and close the
    /// connection. Returns `Err(Shutdown)` when already closing or shut
    /// down.
    pub async fn close(&self) -> Result<()> {
        {
            let mut table = super::lock(&self.inner.table);
            if table.closing || table.shutdown {
                return Err(ClientError::Shutdown);
            }
            table.closing = true;
        }
        CallTable::drain_with(&self.inner.table, || ClientError::Shutdown);
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
        let mut writer = self.inner.writer.lock().await;
        writer.shutdown().await?;
        debug!(addr = %self.remote_addr, "closed");
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
    }
}

impl ClientInner {
    fn is_closing(&self) -> bool {
        super::lock(&self.table).closing
    }

    fn is_shutdown(&self) -> bool {
        super::lock(&self.table).shutdown
    }

    /// Encode args and assemble a request frame. Compression is applied
    /// only to payloads above [`COMPRESS_THRESHOLD`], and the header tag
    /// is set only when compression actually succeeded, so the bits on
    /// the wire always match the payload bytes.
    fn build_request<A>(
        &self,
        service_path: &str,
        service_method: &str,
        args: &A,
        metadata: HashMap<String, String>,
    ) -> Result<Message>
    where
        A: Serialize + ?Sized,
    {
        let mut msg = Message::new();
        msg.header.set_message_type(MessageType::Request);
        msg.header.set_serialize_type(self.opt.serialize_type);
        msg.service_path = service_path.to_owned();
        msg.service_method = service_method.to_owned();
        msg.metadata = metadata;

        let data = self.opt.codecs.encode(self.opt.serialize_type, args)?;
        if self.opt.compress_type != CompressType::None && data.len() > COMPRESS_THRESHOLD {
            match self.opt.compressors.zip(self.opt.compress_type, &data) {
                Ok(zipped) => {
                    msg.header.set_compress_type(self.opt.compress_type);
                    msg.payload = zipped;
                }
                Err(err) => {
                    warn!(%err, "compression failed, sending uncompressed");
                    msg.payload = data;
                }
            }
        } else {
            msg.payload = data;
        }

        Ok(msg)
    }

    async fn issue<A, R>(
        &self,
        service_path: &str,
        service_method: &str,
        args: &A,
        metadata: HashMap<String, String>,
    ) -> Result<CallFuture<R>>
    where
        A: Serialize + ?Sized,
    {
        let mut msg = self.build_request(service_path, service_method, args, metadata)?;

        let (seq, rx) = CallTable::register(&self.table)?;
        msg.header.set_seq(seq);

        if let Err(err) = self.write_frame(&msg).await {
            CallTable::forget(&self.table, seq);
            return Err(err);
        }

        Ok(CallFuture::new(
            seq,
            rx,
            Arc::clone(&self.table),
            Arc::clone(&self.opt.codecs),
        ))
    }

    async fn heartbeat(&self) -> Result<()> {
        let mut msg = Message::new();
        msg.header.set_message_type(MessageType::Request);
        msg.header.set_heartbeat(true);

        let (seq, rx) = CallTable::register(&self.table)?;
        msg.header.set_seq(seq);

        if let Err(err) = self.write_frame(&msg).await {
            CallTable::forget(&self.table, seq);
            return Err(err);
        }

        let fut: CallFuture = CallFuture::new(
            seq,
            rx,
            Arc::clone(&self.table),
            Arc::clone(&self.opt.codecs),
        );
        fut.recv_raw().await.map(|_| ())
    }

    async fn write_frame(&self, msg: &Message) -> Result<()> {
        let frame = msg.encode()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        Ok(())
    }
}

/// Background reader: decodes frames off the connection and resolves
/// pending calls until the stream fails or closes.
async fn read_loop(mut reader: OwnedReadHalf, table: Arc<Mutex<CallTable>>, opt: ClientOptions) {
    let mut msg = Message::new();
    let terminal = loop {
        if let Err(err) = msg.read_from(&mut reader, opt.max_message_size).await {
            break err;
        }

        let seq = msg.seq();
        match msg.header.message_status() {
            MessageStatus::Error => {
                let text = msg
                    .service_error()
                    .unwrap_or("unknown service error")
                    .to_owned();
                CallTable::resolve(&table, seq, Err(ClientError::Service(text)));
            }
            MessageStatus::Normal => {
                let reply = decompress_reply(&opt, &mut msg);
                CallTable::resolve(&table, seq, reply);
            }
        }
    };

    let closing = {
        let mut t = super::lock(&table);
        t.shutdown = true;
        t.closing
    };

    if closing {
        trace!("reader stopped after close");
    } else {
        error!(err = %terminal, "connection lost");
    }

    // Unresolved in-flight calls get a terminal transport error: the
    // user closed us, or the peer went away mid-stream.
    CallTable::drain_with(&table, || {
        if closing {
            ClientError::Shutdown
        } else {
            ClientError::UnexpectedEof
        }
    });
}

/// Turn a decoded response message into a [`Reply`], decompressing the
/// payload per the header tag.
fn decompress_reply(opt: &ClientOptions, msg: &mut Message) -> Result<Reply> {
    let payload = match msg.header.compress_type() {
        Some(CompressType::None) => std::mem::take(&mut msg.payload),
        Some(ct) => opt.compressors.unzip(ct, &msg.payload)?,
        None => {
            return Err(ClientError::Protocol(
                crate::protocol::ProtocolError::UnsupportedCompressor {
                    tag: msg.header.compress_tag(),
                },
            ));
        }
    };
    Ok(Reply {
        metadata: std::mem::take(&mut msg.metadata),
        serialize_tag: msg.header.serialize_tag(),
        payload,
    })
}
