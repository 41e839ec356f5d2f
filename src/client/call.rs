//! In-flight call bookkeeping: the pending table and the caller-side
//! future resolved by the reader task.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::codec::CodecRegistry;
use crate::protocol::SerializeType;

use super::error::{ClientError, Result};

/// A completed response, before the typed payload decode.
#[derive(Debug, Default)]
pub struct Reply {
    /// Response metadata.
    pub metadata: HashMap<String, String>,
    /// Raw serialize tag declared by the response header.
    pub serialize_tag: u8,
    /// Decompressed payload bytes.
    pub payload: Vec<u8>,
}

pub(crate) type ReplySender = oneshot::Sender<Result<Reply>>;

/// Per-connection call table: sequence allocation, pending entries and
/// the closing/shutdown flags, all under one mutex.
///
/// The mutex is never held across an await point; every critical section
/// is a map operation plus a counter bump.
#[derive(Debug, Default)]
pub(crate) struct CallTable {
    pub(crate) pending: HashMap<u64, ReplySender>,
    pub(crate) next_seq: u64,
    pub(crate) closing: bool,
    pub(crate) shutdown: bool,
}

impl CallTable {
    /// Allocate a fresh sequence number and register its reply slot.
    /// Fails when the connection is already going away.
    pub(crate) fn register(table: &Mutex<Self>) -> Result<(u64, oneshot::Receiver<Result<Reply>>)> {
        let mut this = super::lock(table);
        if this.closing || this.shutdown {
            return Err(ClientError::Shutdown);
        }
        let seq = this.next_seq;
        this.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        this.pending.insert(seq, tx);
        Ok((seq, rx))
    }

    /// Remove and resolve one pending entry. A missing entry (already
    /// resolved, or cancelled) is a no-op.
    pub(crate) fn resolve(table: &Mutex<Self>, seq: u64, reply: Result<Reply>) {
        let sender = super::lock(table).pending.remove(&seq);
        if let Some(tx) = sender {
            // A dropped caller just discards the reply.
            let _ = tx.send(reply);
        }
    }

    /// Remove one pending entry without resolving it.
    pub(crate) fn forget(table: &Mutex<Self>, seq: u64) {
        super::lock(table).pending.remove(&seq);
    }

    /// Resolve every pending entry with an error built per call.
    pub(crate) fn drain_with(table: &Mutex<Self>, mut err: impl FnMut() -> ClientError) {
        let drained: Vec<ReplySender> = {
            let mut this = super::lock(table);
            this.pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(err()));
        }
    }
}

/// Handle to one in-flight request.
///
/// Resolution happens exactly once: the reader task, a write failure, or
/// the shutdown sweep fills the underlying single-slot channel. Dropping
/// the future cancels the call — its pending entry is removed
/// immediately, and a late response for that sequence number is
/// discarded as unmatched.
#[derive(Debug)]
pub struct CallFuture<R = Reply> {
    seq: u64,
    rx: oneshot::Receiver<Result<Reply>>,
    table: Arc<Mutex<CallTable>>,
    codecs: Arc<CodecRegistry>,
    _reply: PhantomData<fn() -> R>,
}

impl<R> CallFuture<R> {
    pub(crate) fn new(
        seq: u64,
        rx: oneshot::Receiver<Result<Reply>>,
        table: Arc<Mutex<CallTable>>,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            seq,
            rx,
            table,
            codecs,
            _reply: PhantomData,
        }
    }

    /// Sequence number this call was issued under.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for the raw response without decoding the payload.
    pub async fn recv_raw(mut self) -> Result<Reply> {
        match (&mut self.rx).await {
            Ok(reply) => reply,
            // Sender dropped without resolving: the connection went away.
            Err(_) => Err(ClientError::Shutdown),
        }
    }
}

impl<R: DeserializeOwned> CallFuture<R> {
    /// Wait for the response and decode the payload into `R` using the
    /// codec matching the response's declared serialize type.
    pub async fn recv(self) -> Result<R> {
        let codecs = Arc::clone(&self.codecs);
        let reply = self.recv_raw().await?;
        let st = SerializeType::from_u8(reply.serialize_tag)
            .ok_or(crate::codec::CodecError::UnknownTag(reply.serialize_tag))?;
        Ok(codecs.decode(st, &reply.payload)?)
    }
}

impl<R> Drop for CallFuture<R> {
    fn drop(&mut self) {
        // Cancellation leak-freedom: a dropped caller removes its own
        // pending entry; resolved entries are already gone.
        CallTable::forget(&self.table, self.seq);
    }
}
