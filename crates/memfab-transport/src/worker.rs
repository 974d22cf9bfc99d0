//! Fabric worker: the cooperative progress engine.
//!
//! A worker owns a non-blocking data-plane listener and the table of live
//! channels. All transfer work happens inside [`Worker::progress`]: it
//! accepts waiting peers, drains outgoing queues, reads and dispatches
//! frames, and retires completions. Nothing runs in the background; a
//! worker that is not progressed does no work.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, TransportError};
use crate::fabric::{Context, FeatureSet, ThreadMode};
use crate::frame::{encode_frame, FabricFrame, FrameDecoder};
use crate::memory::RegionRegistry;
use crate::request::{OpStatus, RequestState, Submitted};
use crate::stats::FabricStats;

/// Exported worker address blob contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WorkerAddr {
    pub(crate) cookie: u64,
    pub(crate) addr: SocketAddr,
}

/// A tagged message claimed by a probe. Holds the payload until it is
/// consumed by [`Worker::recv_matched`].
#[derive(Debug)]
pub struct TaggedMessage {
    pub(crate) tag: u64,
    pub(crate) data: Vec<u8>,
}

impl TaggedMessage {
    /// Tag the sender attached to the message.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub(crate) struct Outgoing {
    pub(crate) buf: Vec<u8>,
    pub(crate) off: usize,
    /// Completion slots signalled once the entry is fully written. A fence
    /// with no puts outstanding piggybacks on whatever entry is last in the
    /// queue, so one entry can carry several slots.
    pub(crate) done: Vec<Arc<RequestState>>,
}

impl Outgoing {
    pub(crate) fn new(buf: Vec<u8>) -> Self {
        Self {
            buf,
            off: 0,
            done: Vec::new(),
        }
    }
}

pub(crate) struct GetTarget {
    pub(crate) backing: Arc<Mutex<Vec<u8>>>,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

pub(crate) struct PendingOp {
    pub(crate) channel: u64,
    pub(crate) state: Arc<RequestState>,
    pub(crate) target: Option<GetTarget>,
}

pub(crate) struct Channel {
    pub(crate) id: u64,
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) decoder: FrameDecoder,
    pub(crate) outbox: VecDeque<Outgoing>,
    pub(crate) awaiting_hello: bool,
    /// Set by put submission, cleared by flush. A flush on a channel with
    /// no unfenced puts completes locally instead of round-tripping.
    pub(crate) needs_fence: bool,
    pub(crate) closed: bool,
}

impl Channel {
    fn inbound(id: u64, stream: TcpStream, peer: SocketAddr, max_payload: u32) -> Self {
        Self {
            id,
            stream,
            peer,
            decoder: FrameDecoder::new(max_payload),
            outbox: VecDeque::new(),
            awaiting_hello: true,
            needs_fence: false,
            closed: false,
        }
    }

    pub(crate) fn outbound(id: u64, stream: TcpStream, peer: SocketAddr, max_payload: u32) -> Self {
        Self {
            id,
            stream,
            peer,
            decoder: FrameDecoder::new(max_payload),
            outbox: VecDeque::new(),
            awaiting_hello: false,
            needs_fence: false,
            closed: false,
        }
    }

    /// Writes queued frames until the socket stops accepting bytes.
    /// Returns the number of fully-written entries retired.
    pub(crate) fn flush_outbox(&mut self, stats: &FabricStats) -> usize {
        if self.closed {
            return 0;
        }
        let mut drained = 0;
        loop {
            let finished = {
                let Some(front) = self.outbox.front_mut() else {
                    break;
                };
                match self.stream.write(&front.buf[front.off..]) {
                    Ok(0) => {
                        self.closed = true;
                        break;
                    }
                    Ok(n) => {
                        stats.add_bytes_sent(n as u64);
                        front.off += n;
                        front.off == front.buf.len()
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => false,
                    Err(e) => {
                        tracing::debug!(peer = %self.peer, error = %e, "fabric channel write failed");
                        self.closed = true;
                        break;
                    }
                }
            };
            if finished {
                if let Some(sent) = self.outbox.pop_front() {
                    for state in sent.done {
                        state.finish(OpStatus::Success);
                        stats.inc_requests_completed();
                    }
                    drained += 1;
                }
            }
        }
        drained
    }

    /// Reads everything the socket has ready and decodes complete frames.
    /// A protocol error poisons the channel.
    fn read_ready(&mut self, stats: &FabricStats) -> Vec<FabricFrame> {
        let mut frames = Vec::new();
        if self.closed {
            return frames;
        }
        let mut tmp = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut tmp) {
                Ok(0) => {
                    tracing::debug!(peer = %self.peer, "fabric channel closed by peer");
                    self.closed = true;
                    break;
                }
                Ok(n) => {
                    stats.add_bytes_received(n as u64);
                    self.decoder.extend(&tmp[..n]);
                    loop {
                        match self.decoder.next_frame() {
                            Ok(Some(frame)) => frames.push(frame),
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(peer = %self.peer, error = %e, "fabric channel protocol error");
                                stats.inc_protocol_errors();
                                self.closed = true;
                                return frames;
                            }
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(peer = %self.peer, error = %e, "fabric channel read failed");
                    self.closed = true;
                    break;
                }
            }
        }
        frames
    }
}

pub(crate) struct WorkerState {
    pub(crate) listener: TcpListener,
    pub(crate) channels: Vec<Channel>,
    pub(crate) unexpected: VecDeque<TaggedMessage>,
    pub(crate) pending: HashMap<u64, PendingOp>,
}

impl WorkerState {
    pub(crate) fn channel_mut(&mut self, id: u64) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.id == id)
    }
}

pub(crate) struct WorkerShared {
    pub(crate) state: Mutex<WorkerState>,
    pub(crate) registry: Arc<RegionRegistry>,
    pub(crate) stats: Arc<FabricStats>,
    pub(crate) features: FeatureSet,
    pub(crate) max_frame_payload: u32,
    pub(crate) cookie: u64,
    pub(crate) next_op: AtomicU64,
    pub(crate) next_channel: AtomicU64,
}

impl WorkerShared {
    pub(crate) fn next_op_id(&self) -> u64 {
        self.next_op.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_channel_id(&self) -> u64 {
        self.next_channel.fetch_add(1, Ordering::Relaxed)
    }

    /// Tears down a channel and fails everything still riding on it.
    pub(crate) fn close_channel(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        fail_channel_locked(&mut state, id, &self.stats);
    }
}

/// Removes a channel from the table and fails its unsent entries and
/// pending replies with a disconnected status.
pub(crate) fn fail_channel_locked(state: &mut WorkerState, id: u64, stats: &FabricStats) {
    if let Some(pos) = state.channels.iter().position(|c| c.id == id) {
        let channel = state.channels.remove(pos);
        for out in channel.outbox {
            for st in out.done {
                st.finish(OpStatus::Disconnected);
                stats.inc_requests_failed();
            }
        }
        stats.connection_closed();
        tracing::debug!(peer = %channel.peer, id, "fabric channel removed");
    }
    let dead: Vec<u64> = state
        .pending
        .iter()
        .filter(|(_, p)| p.channel == id)
        .map(|(op, _)| *op)
        .collect();
    for op in dead {
        if let Some(p) = state.pending.remove(&op) {
            p.state.finish(OpStatus::Disconnected);
            stats.inc_requests_failed();
        }
    }
}

/// Fabric worker bound to one data-plane listener.
pub struct Worker {
    shared: Arc<WorkerShared>,
    listen_addr: SocketAddr,
    thread_mode: ThreadMode,
}

impl Worker {
    /// Creates a worker for the given context, binding the data-plane
    /// listener from the context's configuration.
    pub fn new(context: &Context) -> Result<Self> {
        let ctx = context.shared();
        let listener = TcpListener::bind(ctx.config.bind_addr).map_err(|e| {
            TransportError::Init {
                reason: format!("fabric bind {}: {e}", ctx.config.bind_addr),
            }
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TransportError::Init {
                reason: format!("fabric listener mode: {e}"),
            })?;
        let listen_addr = listener.local_addr().map_err(|e| TransportError::Init {
            reason: format!("fabric local addr: {e}"),
        })?;
        let cookie = rand::random();
        tracing::debug!(addr = %listen_addr, "fabric worker listening");
        Ok(Self {
            shared: Arc::new(WorkerShared {
                state: Mutex::new(WorkerState {
                    listener,
                    channels: Vec::new(),
                    unexpected: VecDeque::new(),
                    pending: HashMap::new(),
                }),
                registry: ctx.registry.clone(),
                stats: ctx.stats.clone(),
                features: ctx.features,
                max_frame_payload: ctx.config.max_frame_payload,
                cookie,
                next_op: AtomicU64::new(1),
                next_channel: AtomicU64::new(1),
            }),
            listen_addr,
            thread_mode: ctx.config.thread_mode,
        })
    }

    /// Address of the data-plane listener.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Declared threading contract.
    pub fn thread_mode(&self) -> ThreadMode {
        self.thread_mode
    }

    /// Serializes the worker's address for out-of-band exchange. Every call
    /// returns a fresh copy.
    pub fn export_address(&self) -> Result<Vec<u8>> {
        let addr = WorkerAddr {
            cookie: self.shared.cookie,
            addr: self.listen_addr,
        };
        bincode::serialize(&addr).map_err(|e| TransportError::SerializationError(e.to_string()))
    }

    /// Performs one non-blocking sweep of fabric work: accepts waiting
    /// peers, flushes outgoing queues, reads and dispatches frames.
    /// Returns the amount of work done; zero means the fabric was idle.
    pub fn progress(&self) -> usize {
        self.shared.stats.inc_progress_calls();
        let mut state = self.shared.state.lock().unwrap();
        let mut work = 0;

        loop {
            match state.listener.accept() {
                Ok((stream, peer)) => {
                    let ready = stream
                        .set_nonblocking(true)
                        .and_then(|()| stream.set_nodelay(true));
                    if let Err(e) = ready {
                        tracing::warn!(peer = %peer, error = %e, "rejecting fabric channel");
                        continue;
                    }
                    let id = self.shared.next_channel_id();
                    state.channels.push(Channel::inbound(
                        id,
                        stream,
                        peer,
                        self.shared.max_frame_payload,
                    ));
                    self.shared.stats.connection_opened();
                    tracing::debug!(peer = %peer, id, "fabric channel accepted");
                    work += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "fabric accept failed");
                    break;
                }
            }
        }

        let mut closed = Vec::new();
        let mut idx = 0;
        while idx < state.channels.len() {
            let (drained, frames) = {
                let channel = &mut state.channels[idx];
                (
                    channel.flush_outbox(&self.shared.stats),
                    channel.read_ready(&self.shared.stats),
                )
            };
            work += drained;
            for frame in frames {
                work += 1;
                self.handle_frame(&mut state, idx, frame);
            }
            let channel = &mut state.channels[idx];
            work += channel.flush_outbox(&self.shared.stats);
            if channel.closed {
                closed.push(channel.id);
            }
            idx += 1;
        }
        for id in closed {
            fail_channel_locked(&mut state, id, &self.shared.stats);
        }
        work
    }

    fn handle_frame(&self, state: &mut WorkerState, idx: usize, frame: FabricFrame) {
        let stats = &self.shared.stats;

        if state.channels[idx].awaiting_hello {
            match frame {
                FabricFrame::Hello { cookie } if cookie == self.shared.cookie => {
                    let channel = &mut state.channels[idx];
                    channel.awaiting_hello = false;
                    tracing::debug!(peer = %channel.peer, "fabric channel established");
                }
                _ => {
                    let channel = &mut state.channels[idx];
                    tracing::warn!(peer = %channel.peer, "rejecting channel: bad hello");
                    stats.inc_protocol_errors();
                    channel.closed = true;
                }
            }
            return;
        }

        match frame {
            FabricFrame::Hello { .. } => {
                let channel = &mut state.channels[idx];
                tracing::warn!(peer = %channel.peer, "unexpected hello on established channel");
                stats.inc_protocol_errors();
                channel.closed = true;
            }
            FabricFrame::Tagged { tag, data } => {
                state.unexpected.push_back(TaggedMessage { tag, data });
                stats.inc_messages_unexpected();
            }
            FabricFrame::Put { key, raddr, data } => {
                if let Err(reason) = self.shared.registry.apply_put(key, raddr, &data) {
                    tracing::warn!(key, raddr, %reason, "put faulted");
                    stats.inc_remote_faults();
                }
            }
            FabricFrame::Get {
                key,
                raddr,
                len,
                op,
            } => {
                let reply = match self.shared.registry.read_get(key, raddr, len) {
                    Ok(data) => FabricFrame::GetReply { op, data },
                    Err(reason) => {
                        tracing::warn!(key, raddr, len, %reason, "get faulted");
                        stats.inc_remote_faults();
                        FabricFrame::GetFault { op, reason }
                    }
                };
                if !self.queue_reply(state, idx, reply) {
                    stats.inc_remote_faults();
                    let fault = FabricFrame::GetFault {
                        op,
                        reason: "reply exceeds frame cap".to_string(),
                    };
                    let _ = self.queue_reply(state, idx, fault);
                }
            }
            FabricFrame::Flush { op } => {
                let _ = self.queue_reply(state, idx, FabricFrame::FlushAck { op });
            }
            FabricFrame::GetReply { op, data } => match state.pending.remove(&op) {
                Some(p) => {
                    let done = match &p.target {
                        Some(t) if data.len() == t.len => {
                            let mut buf = t.backing.lock().unwrap();
                            buf[t.offset..t.offset + t.len].copy_from_slice(&data);
                            true
                        }
                        _ => false,
                    };
                    if done {
                        p.state.finish(OpStatus::Success);
                        stats.inc_requests_completed();
                    } else {
                        tracing::warn!(op, "mismatched get reply");
                        p.state.finish(OpStatus::RemoteFault);
                        stats.inc_requests_failed();
                        stats.inc_remote_faults();
                    }
                }
                None => stats.inc_protocol_errors(),
            },
            FabricFrame::GetFault { op, reason } => match state.pending.remove(&op) {
                Some(p) => {
                    tracing::warn!(op, %reason, "get faulted remotely");
                    p.state.finish(OpStatus::RemoteFault);
                    stats.inc_requests_failed();
                    stats.inc_remote_faults();
                }
                None => stats.inc_protocol_errors(),
            },
            FabricFrame::FlushAck { op } => match state.pending.remove(&op) {
                Some(p) => {
                    p.state.finish(OpStatus::Success);
                    stats.inc_requests_completed();
                }
                None => stats.inc_protocol_errors(),
            },
        }
    }

    fn queue_reply(&self, state: &mut WorkerState, idx: usize, frame: FabricFrame) -> bool {
        match encode_frame(&frame, self.shared.max_frame_payload) {
            Ok(buf) => {
                state.channels[idx].outbox.push_back(Outgoing::new(buf));
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping reply frame");
                false
            }
        }
    }

    /// Non-blocking probe for a queued tagged message. A set mask bit
    /// requires equality on that bit. The matched message is removed from
    /// the queue and returned for consumption.
    pub fn probe_tagged(&self, tag: u64, mask: u64) -> Result<Option<TaggedMessage>> {
        self.require_tag_feature()?;
        let mut state = self.shared.state.lock().unwrap();
        let found = state
            .unexpected
            .iter()
            .position(|m| (m.tag ^ tag) & mask == 0);
        match found {
            Some(i) => {
                let msg = state.unexpected.remove(i);
                if msg.is_some() {
                    self.shared.stats.inc_messages_matched();
                }
                Ok(msg)
            }
            None => Ok(None),
        }
    }

    /// Consumes a probed message into the caller's buffer. The payload was
    /// already delivered, so the receive completes immediately. A buffer
    /// smaller than the message is an error; the message is consumed
    /// either way.
    pub fn recv_matched(&self, msg: TaggedMessage, buf: &mut [u8]) -> Result<Submitted> {
        self.require_tag_feature()?;
        if buf.len() < msg.data.len() {
            return Err(TransportError::MessageTruncated {
                needed: msg.data.len(),
                got: buf.len(),
            });
        }
        buf[..msg.data.len()].copy_from_slice(&msg.data);
        self.shared.stats.inc_requests_completed();
        Ok(Submitted::Completed)
    }

    fn require_tag_feature(&self) -> Result<()> {
        if !self.shared.features.contains(FeatureSet::TAG) {
            return Err(TransportError::Setup {
                reason: "worker lacks the tag-matching feature".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }
}
