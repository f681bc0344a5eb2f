// SPDX-License-Identifier: MIT

//! A capability session over a bidirectional byte stream.
//!
//! One reader thread per connection decodes frames and routes them.  Incoming
//! calls are dispatched on their own threads, so a server blocking on a
//! nested call never stalls the reader.  Outgoing calls block the caller until
//! the matching `Return` arrives or the connection closes.

use std::{
    collections::HashMap,
    net::Shutdown,
    os::unix::net::UnixStream,
    sync::{Arc, Condvar, Mutex},
    thread,
};

use tracing::{debug, info, warn};

use super::{
    client::{CapRef, Hook, Payload, RefCount},
    lock,
};
use crate::{
    comm::{
        frame::{DEFAULT_MAX_PAYLOAD_SIZE, FrameReader, FrameWriter},
        message::{Message, WirePayload},
    },
    error::RpcError,
};

/// A live capability session.  Clones refer to the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    writer: Mutex<UnixStream>,
    socket: UnixStream,
    state: Mutex<ConnState>,
    changed: Condvar,
}

struct ConnState {
    /// What the peer receives when it asks for our bootstrap.
    bootstrap: Option<CapRef>,
    exports: HashMap<u32, Export>,
    next_export: u32,
    questions: HashMap<u32, Arc<AnswerSlot>>,
    next_question: u32,
    closed: Option<RpcError>,
    reader_done: bool,
}

struct Export {
    cap: CapRef,
    refs: u32,
}

impl Connection {
    /// Start a session over `stream`, offering `bootstrap` to the peer.
    ///
    /// The connection owns `bootstrap` and releases it when it closes, or
    /// right away if the session cannot start.
    pub fn new(stream: UnixStream, bootstrap: Option<CapRef>) -> Result<Connection, std::io::Error> {
        let clones = stream.try_clone().and_then(|r| Ok((r, stream.try_clone()?)));
        let (reader_stream, socket) = match clones {
            Ok(c) => c,
            Err(e) => {
                if let Some(cap) = bootstrap {
                    cap.release();
                }
                return Err(e);
            }
        };
        let inner = Arc::new(ConnInner {
            writer: Mutex::new(stream),
            socket,
            state: Mutex::new(ConnState {
                bootstrap,
                exports: HashMap::new(),
                next_export: 0,
                questions: HashMap::new(),
                next_question: 0,
                closed: None,
                reader_done: false,
            }),
            changed: Condvar::new(),
        });

        let reader_inner = inner.clone();
        let spawned = thread::Builder::new()
            .name("capability-conn".to_string())
            .spawn(move || reader_inner.run_reader(reader_stream));
        if let Err(e) = spawned {
            inner.close(RpcError::Disconnected(format!("reader thread failed: {e}")));
            inner.mark_reader_done();
            return Err(e);
        }
        Ok(Connection { inner })
    }

    /// The peer's bootstrap capability.
    ///
    /// Returns at once with a promise; calls on it wait for the peer's answer.
    /// If the peer offers no bootstrap, or the connection closes first, calls
    /// fail with that reason.
    pub fn bootstrap(&self) -> CapRef {
        let slot = Arc::new(AnswerSlot::new());
        let question = {
            let mut st = lock(&self.inner.state);
            match st.closed.clone() {
                Some(e) => Err(e),
                None => Ok(st.new_question(slot.clone())),
            }
        };
        match question {
            Ok(question) => self.inner.send(Message::Bootstrap { question }),
            Err(e) => slot.fulfill(Err(e)),
        }
        CapRef::from_hook(Arc::new(PromiseHook {
            slot,
            resolved: Mutex::new(None),
            refs: RefCount::new(),
        }))
    }

    /// Close the session from this side.  Pending calls fail; exports and the
    /// offered bootstrap are released.
    pub fn shutdown(&self) {
        if !self.is_closed() {
            self.inner.send(Message::Abort {
                reason: "connection shut down".to_string(),
            });
        }
        self.inner
            .close(RpcError::Disconnected("connection shut down locally".to_string()));
    }

    /// Block until the session is closed and its reader has stopped.
    pub fn wait_closed(&self) {
        let mut st = lock(&self.inner.state);
        while st.closed.is_none() || !st.reader_done {
            st = self
                .inner
                .changed
                .wait(st)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed.is_some()
    }

    /// Why the session closed, once it has.
    pub fn closed_reason(&self) -> Option<RpcError> {
        lock(&self.inner.state).closed.clone()
    }

    /// Number of capabilities the peer currently holds from this side.
    pub fn export_count(&self) -> usize {
        lock(&self.inner.state).exports.len()
    }
}

impl ConnState {
    fn new_question(&mut self, slot: Arc<AnswerSlot>) -> u32 {
        let id = self.next_question;
        self.next_question = self.next_question.wrapping_add(1);
        self.questions.insert(id, slot);
        id
    }
}

impl ConnInner {
    fn run_reader(self: Arc<Self>, mut stream: UnixStream) {
        let reader = FrameReader::new(DEFAULT_MAX_PAYLOAD_SIZE);
        loop {
            let frame = match reader.read(&mut stream) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.close(RpcError::Disconnected("peer closed the connection".to_string()));
                    break;
                }
                Err(e) => {
                    self.close(RpcError::Disconnected(e.to_string()));
                    break;
                }
            };
            match Message::decode(&frame) {
                Ok(msg) => self.handle(msg),
                Err(e) => {
                    warn!(error = %e, "undecodable capability message");
                    self.send(Message::Abort {
                        reason: format!("undecodable message: {e}"),
                    });
                    self.close(RpcError::Protocol(e.to_string()));
                    break;
                }
            }
            if lock(&self.state).closed.is_some() {
                break;
            }
        }
        self.mark_reader_done();
    }

    fn handle(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::Bootstrap { question } => {
                let offered = lock(&self.state).bootstrap.as_ref().map(CapRef::acquire);
                let result = match offered {
                    Some(cap) => Ok(self.export_payload(Payload::empty().with_cap(cap))),
                    None => Err("no bootstrap capability offered".to_string()),
                };
                self.send(Message::Return {
                    answer: question,
                    result,
                });
            }
            Message::Call {
                question,
                target,
                method,
                params,
            } => {
                let cap = lock(&self.state)
                    .exports
                    .get(&target)
                    .map(|e| e.cap.acquire());
                let params = self.import_payload(params);
                match cap {
                    None => {
                        params.release();
                        self.send(Message::Return {
                            answer: question,
                            result: Err(format!("unknown capability {target}")),
                        });
                    }
                    Some(cap) => {
                        let inner = self.clone();
                        thread::spawn(move || {
                            let res = cap.call(method, params);
                            cap.release();
                            let result = match res {
                                Ok(payload) => Ok(inner.export_payload(payload)),
                                Err(e) => Err(e.to_string()),
                            };
                            inner.send(Message::Return {
                                answer: question,
                                result,
                            });
                        });
                    }
                }
            }
            Message::Return { answer, result } => {
                let slot = lock(&self.state).questions.remove(&answer);
                match slot {
                    Some(slot) => {
                        let result = match result {
                            Ok(wire) => Ok(self.import_payload(wire)),
                            Err(reason) => Err(RpcError::Remote(reason)),
                        };
                        slot.fulfill(result);
                    }
                    None => {
                        self.send(Message::Abort {
                            reason: format!("return for unknown question {answer}"),
                        });
                        self.close(RpcError::Protocol(format!(
                            "return for unknown question {answer}"
                        )));
                    }
                }
            }
            Message::Release { export, count } => {
                let released = {
                    let mut st = lock(&self.state);
                    match st.exports.get_mut(&export) {
                        Some(e) => {
                            e.refs = e.refs.saturating_sub(count);
                            if e.refs == 0 {
                                st.exports.remove(&export).map(|e| e.cap)
                            } else {
                                None
                            }
                        }
                        None => {
                            debug!(export, "release for unknown export");
                            None
                        }
                    }
                };
                if let Some(cap) = released {
                    cap.release();
                }
            }
            Message::Abort { reason } => {
                self.close(RpcError::Disconnected(format!("peer aborted: {reason}")));
            }
        }
    }

    /// Send one call and block for its answer.
    fn call(self: &Arc<Self>, target: u32, method: u16, params: Payload) -> Result<Payload, RpcError> {
        let slot = Arc::new(AnswerSlot::new());
        let question = {
            let mut st = lock(&self.state);
            if let Some(e) = &st.closed {
                let e = e.clone();
                drop(st);
                params.release();
                return Err(e);
            }
            st.new_question(slot.clone())
        };
        let params = self.export_payload(params);
        // A failed send closes the connection, which fails the slot.
        self.send(Message::Call {
            question,
            target,
            method,
            params,
        });
        slot.wait()
    }

    /// Move the payload's capabilities into the export table.
    fn export_payload(&self, payload: Payload) -> WirePayload {
        let mut caps = Vec::with_capacity(payload.caps.len());
        let mut dead = Vec::new();
        {
            let mut st = lock(&self.state);
            for cap in payload.caps {
                if cap.is_null() {
                    cap.release();
                    caps.push(None);
                } else if st.closed.is_some() {
                    dead.push(cap);
                    caps.push(None);
                } else {
                    let id = st.next_export;
                    st.next_export = st.next_export.wrapping_add(1);
                    st.exports.insert(id, Export { cap, refs: 1 });
                    caps.push(Some(id));
                }
            }
        }
        for cap in dead {
            cap.release();
        }
        WirePayload {
            content: payload.content,
            caps,
        }
    }

    /// Turn the peer's export ids into imported capabilities.
    fn import_payload(self: &Arc<Self>, wire: WirePayload) -> Payload {
        let caps = wire
            .caps
            .into_iter()
            .map(|id| match id {
                Some(id) => CapRef::from_hook(Arc::new(ImportHook {
                    conn: self.clone(),
                    id,
                    refs: RefCount::new(),
                })),
                None => CapRef::null(),
            })
            .collect();
        Payload {
            content: wire.content,
            caps,
        }
    }

    fn send(&self, msg: Message) {
        if lock(&self.state).closed.is_some() {
            return;
        }
        let buf = msg.encode();
        let res = FrameWriter::new().write(&mut *lock(&self.writer), &buf);
        if let Err(e) = res {
            self.close(RpcError::Disconnected(e.to_string()));
        }
    }

    /// Close once.  Later calls keep the first reason.
    fn close(&self, reason: RpcError) {
        let (questions, exports, bootstrap) = {
            let mut st = lock(&self.state);
            if st.closed.is_some() {
                return;
            }
            st.closed = Some(reason.clone());
            (
                st.questions.drain().map(|(_, slot)| slot).collect::<Vec<_>>(),
                st.exports.drain().map(|(_, e)| e.cap).collect::<Vec<_>>(),
                st.bootstrap.take(),
            )
        };
        info!(reason = %reason, "capability connection closed");
        let _ = self.socket.shutdown(Shutdown::Both);
        for slot in questions {
            slot.fulfill(Err(reason.clone()));
        }
        for cap in exports {
            cap.release();
        }
        if let Some(cap) = bootstrap {
            cap.release();
        }
        self.changed.notify_all();
    }

    fn mark_reader_done(&self) {
        lock(&self.state).reader_done = true;
        self.changed.notify_all();
    }
}

/// Where a question's answer lands.
struct AnswerSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

enum SlotState {
    Waiting,
    Ready(Result<Payload, RpcError>),
    Taken,
    /// Nobody will read the answer; release it on arrival.
    Abandoned,
}

impl AnswerSlot {
    fn new() -> Self {
        AnswerSlot {
            state: Mutex::new(SlotState::Waiting),
            ready: Condvar::new(),
        }
    }

    fn fulfill(&self, result: Result<Payload, RpcError>) {
        let unwanted = {
            let mut st = lock(&self.state);
            match *st {
                SlotState::Waiting => {
                    *st = SlotState::Ready(result);
                    None
                }
                _ => Some(result),
            }
        };
        self.ready.notify_all();
        if let Some(Ok(payload)) = unwanted {
            payload.release();
        }
    }

    fn wait(&self) -> Result<Payload, RpcError> {
        let mut st = lock(&self.state);
        while matches!(*st, SlotState::Waiting) {
            st = self
                .ready
                .wait(st)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        match std::mem::replace(&mut *st, SlotState::Taken) {
            SlotState::Ready(result) => result,
            _ => Err(RpcError::Failed("answer already consumed".to_string())),
        }
    }

    fn abandon(&self) {
        let ready = {
            let mut st = lock(&self.state);
            match std::mem::replace(&mut *st, SlotState::Abandoned) {
                SlotState::Ready(result) => Some(result),
                _ => None,
            }
        };
        if let Some(Ok(payload)) = ready {
            payload.release();
        }
    }
}

/// A capability exported by the peer.
struct ImportHook {
    conn: Arc<ConnInner>,
    id: u32,
    refs: RefCount,
}

impl Hook for ImportHook {
    fn call(&self, method: u16, params: Payload) -> Result<Payload, RpcError> {
        self.conn.call(self.id, method, params)
    }

    fn refs(&self) -> &RefCount {
        &self.refs
    }

    fn last_release(&self) {
        self.conn.send(Message::Release {
            export: self.id,
            count: 1,
        });
    }

    fn kind(&self) -> &'static str {
        "import"
    }
}

/// The answer to a bootstrap question, resolved on first use.
struct PromiseHook {
    slot: Arc<AnswerSlot>,
    resolved: Mutex<Option<Result<CapRef, RpcError>>>,
    refs: RefCount,
}

impl PromiseHook {
    fn target(&self) -> Result<CapRef, RpcError> {
        let mut resolved = lock(&self.resolved);
        let target = resolved.get_or_insert_with(|| {
            self.slot.wait().map(|mut payload| {
                let cap = payload.take_cap(0);
                payload.release();
                cap
            })
        });
        match target {
            Ok(cap) => Ok(cap.acquire()),
            Err(e) => Err(e.clone()),
        }
    }
}

impl Hook for PromiseHook {
    fn call(&self, method: u16, params: Payload) -> Result<Payload, RpcError> {
        match self.target() {
            Ok(cap) => {
                let res = cap.call(method, params);
                cap.release();
                res
            }
            Err(e) => {
                params.release();
                Err(e)
            }
        }
    }

    fn refs(&self) -> &RefCount {
        &self.refs
    }

    fn last_release(&self) {
        match lock(&self.resolved).take() {
            Some(Ok(cap)) => cap.release(),
            Some(Err(_)) => {}
            None => self.slot.abandon(),
        }
    }

    fn kind(&self) -> &'static str {
        "promise"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::capability::client::tests::Echo;
    use crate::capability::Server;

    /// Hands out a fresh Echo capability from method 1.
    struct Factory {
        shutdowns: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Server for Factory {
        fn dispatch(&self, method: u16, params: Payload) -> Result<Payload, RpcError> {
            params.release();
            match method {
                1 => Ok(Payload::empty().with_cap(CapRef::local(Echo {
                    shutdowns: self.shutdowns.clone(),
                }))),
                _ => Err(RpcError::Unimplemented(method)),
            }
        }
    }

    fn pair(
        left: Option<CapRef>,
        right: Option<CapRef>,
    ) -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().expect("socket pair");
        (
            Connection::new(a, left).expect("left connection"),
            Connection::new(b, right).expect("right connection"),
        )
    }

    fn eventually(what: &str, check: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn bootstrap_call_round_trips() {
        let (echo, _) = Echo::new();
        let (host, grain) = pair(Some(CapRef::local(echo)), None);

        let remote = grain.bootstrap();
        let res = remote.call(0, Payload::new(b"hello".to_vec())).unwrap();
        assert_eq!(res.content, b"hello");
        res.release();
        remote.release();

        host.shutdown();
        host.wait_closed();
        grain.wait_closed();
    }

    #[test]
    fn both_sides_offer_bootstraps() {
        let (host_echo, _) = Echo::new();
        let (grain_echo, _) = Echo::new();
        let (host, grain) = pair(
            Some(CapRef::local(host_echo)),
            Some(CapRef::local(grain_echo)),
        );

        let to_grain = host.bootstrap();
        let to_host = grain.bootstrap();
        let a = to_grain.call(0, Payload::new(b"a".to_vec())).unwrap();
        let b = to_host.call(0, Payload::new(b"b".to_vec())).unwrap();
        assert_eq!((a.content.as_slice(), b.content.as_slice()), (&b"a"[..], &b"b"[..]));
        a.release();
        b.release();
        to_grain.release();
        to_host.release();
        host.shutdown();
        grain.wait_closed();
    }

    #[test]
    fn missing_bootstrap_fails_calls() {
        let (host, grain) = pair(None, None);
        let remote = host.bootstrap();
        let err = remote.call(0, Payload::empty()).unwrap_err();
        assert_eq!(
            err,
            RpcError::Remote("no bootstrap capability offered".to_string())
        );
        remote.release();
        grain.shutdown();
        host.wait_closed();
    }

    #[test]
    fn returned_capability_released_on_peer() {
        let shutdowns = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let factory = Factory {
            shutdowns: shutdowns.clone(),
        };
        let (host, grain) = pair(Some(CapRef::local(factory)), None);

        let remote = grain.bootstrap();
        let mut res = remote.call(1, Payload::empty()).unwrap();
        let made = res.take_cap(0);
        res.release();
        let echoed = made.call(0, Payload::new(b"x".to_vec())).unwrap();
        assert_eq!(echoed.content, b"x");
        echoed.release();

        // Bootstrap plus the made capability.
        assert_eq!(host.export_count(), 2);
        made.release();
        eventually("made capability release", || {
            shutdowns.load(Ordering::SeqCst) == 1
        });
        assert_eq!(host.export_count(), 1);

        remote.release();
        eventually("bootstrap release", || host.export_count() == 0);
        host.shutdown();
        grain.wait_closed();
    }

    #[test]
    fn capability_passed_as_param_is_callable_by_peer() {
        // The host's bootstrap echoes params back, so the grain gets its own
        // capability back as an import of an import.
        let (host_echo, _) = Echo::new();
        let (grain_echo, grain_shutdowns) = Echo::new();
        let (host, grain) = pair(Some(CapRef::local(host_echo)), None);

        let remote = grain.bootstrap();
        let mut res = remote
            .call(0, Payload::empty().with_cap(CapRef::local(grain_echo)))
            .unwrap();
        let looped = res.take_cap(0);
        res.release();
        let back = looped.call(0, Payload::new(b"loop".to_vec())).unwrap();
        assert_eq!(back.content, b"loop");
        back.release();
        looped.release();
        remote.release();

        eventually("looped capability release", || {
            grain_shutdowns.load(Ordering::SeqCst) == 1
        });
        host.shutdown();
        grain.wait_closed();
    }

    #[test]
    fn close_fails_pending_and_releases_bootstrap() {
        let (echo, shutdowns) = Echo::new();
        let (host, grain) = pair(Some(CapRef::local(echo)), None);

        grain.shutdown();
        grain.wait_closed();
        host.wait_closed();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(matches!(
            host.closed_reason(),
            Some(RpcError::Disconnected(_))
        ));

        let remote = host.bootstrap();
        assert!(matches!(
            remote.call(0, Payload::empty()),
            Err(RpcError::Disconnected(_))
        ));
        remote.release();
    }

    #[test]
    fn garbage_from_peer_closes_with_protocol_error() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let conn = Connection::new(a, None).unwrap();
        FrameWriter::new().write(&mut b, &[0x42]).unwrap();
        conn.wait_closed();
        assert!(matches!(conn.closed_reason(), Some(RpcError::Protocol(_))));
    }

    #[test]
    fn abandoned_bootstrap_is_released() {
        let (echo, shutdowns) = Echo::new();
        let (host, grain) = pair(Some(CapRef::local(echo)), None);

        // Released before anyone waits on it.
        grain.bootstrap().release();
        eventually("bootstrap export drop", || host.export_count() == 0);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
        host.shutdown();
        grain.wait_closed();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
