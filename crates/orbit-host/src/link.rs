//! The RPC connection to one running extension process.
//!
//! A [`Connection`] owns the child process; its [`Link`] owns the pipes. A
//! dedicated reader thread routes incoming frames: responses by request id,
//! memory requests by broker id. Both land in the inbox of the thread that
//! issued the call, which answers memory requests itself. Guest memory is
//! therefore only ever touched by the thread executing the guest.

use std::io::BufReader;
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded, unbounded};
use dashmap::DashMap;
use orbit_core::protocol::{MAGIC, MAGIC_ENV};
use orbit_core::{
    BrokerId, CallEnvelope, ExtensionMessage, HostMessage, InstanceId, IoStatus, MemoryReply,
    MemoryRequest, Request, Response, read_frame, write_frame,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::memory::{GuestMemory, MemoryBridgeServer};

/// How many times a spawn is retried while the binary is still busy.
const SPAWN_ATTEMPTS: u32 = 5;

/// Traffic delivered to the thread waiting on a request.
enum Inbound {
    Response(Response),
    Memory { id: u64, request: MemoryRequest },
}

/// The framed pipe pair to an extension, plus request routing.
pub(crate) struct Link {
    label: String,
    stdin: Mutex<ChildStdin>,
    pending: DashMap<u64, Sender<Inbound>>,
    brokers: DashMap<BrokerId, Sender<Inbound>>,
    next_id: AtomicU64,
    next_broker: AtomicU64,
    closed: AtomicBool,
}

impl Link {
    fn new(label: String, stdin: ChildStdin) -> Self {
        Self {
            label,
            stdin: Mutex::new(stdin),
            pending: DashMap::new(),
            brokers: DashMap::new(),
            next_id: AtomicU64::new(1),
            next_broker: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether the connection is known to be broken.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the connection broken and fail everything waiting on it.
    pub(crate) fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(extension = %self.label, "Link closed");
        }
        // Dropping the senders wakes every waiter with a disconnect.
        self.pending.clear();
        self.brokers.clear();
    }

    fn send(&self, message: &HostMessage) -> BridgeResult<()> {
        if self.is_closed() {
            return Err(self.unreachable());
        }
        let mut stdin = self.stdin.lock();
        write_frame(&mut *stdin, message).map_err(|e| {
            BridgeError::ExtensionUnreachable(format!("{}: {e}", self.label))
        })
    }

    fn unreachable(&self) -> BridgeError {
        BridgeError::ExtensionUnreachable(format!("{}: connection closed", self.label))
    }

    /// Issue a request that involves no guest memory.
    pub(crate) fn request(&self, request: Request, timeout: Option<Duration>) -> BridgeResult<Response> {
        let (tx, rx) = unbounded();
        let label = request_label(&request);
        self.exchange(&label, request, tx, rx, timeout, |request| {
            warn!("Memory request outside of a call");
            request.failed(IoStatus::Other)
        })
    }

    /// Invoke `function`, serving memory requests against `memory` until
    /// the call completes.
    pub(crate) fn call(
        &self,
        function: &str,
        instance: InstanceId,
        inputs: Vec<u64>,
        memory: &mut dyn GuestMemory,
        timeout: Option<Duration>,
    ) -> BridgeResult<Response> {
        let (tx, rx) = unbounded();
        let broker = BrokerId(self.next_broker.fetch_add(1, Ordering::Relaxed));
        self.brokers.insert(broker, tx.clone());
        let _broker = BrokerGuard { link: self, broker };

        let mut server = MemoryBridgeServer::new(broker, instance);
        let envelope = CallEnvelope {
            function: function.to_string(),
            broker,
            instance,
            inputs,
        };

        let response = self.exchange(function, Request::Call(envelope), tx, rx, timeout, |request| {
            server.serve(&mut *memory, request)
        });
        trace!(function, %broker, served = server.served(), "Call finished");
        response
    }

    fn exchange(
        &self,
        label: &str,
        request: Request,
        tx: Sender<Inbound>,
        rx: crossbeam_channel::Receiver<Inbound>,
        timeout: Option<Duration>,
        mut on_memory: impl FnMut(MemoryRequest) -> MemoryReply,
    ) -> BridgeResult<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(id, tx);
        let _pending = PendingGuard { link: self, id };

        // The reader marks the link closed before clearing the maps, so a
        // sender inserted after the clear is caught here.
        if self.is_closed() {
            return Err(self.unreachable());
        }

        self.send(&HostMessage::Request { id, request })?;

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let inbound = match deadline {
                Some(deadline) => rx.recv_deadline(deadline),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match inbound {
                Ok(Inbound::Response(response)) => return Ok(response),
                Ok(Inbound::Memory { id, request }) => {
                    let fallback = request.failed(IoStatus::Other);
                    let reply = on_memory(request);
                    if let Err(e) = self.send(&HostMessage::MemoryReply { id, reply }) {
                        // The extension still waits on this request.
                        warn!(extension = %self.label, id, error = %e, "Memory reply not sent");
                        self.send(&HostMessage::MemoryReply {
                            id,
                            reply: fallback,
                        })?;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(BridgeError::CallTimedOut {
                        function: label.to_string(),
                        timeout: timeout.unwrap_or_default(),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(self.unreachable()),
            }
        }
    }

    fn read_loop(self: Arc<Self>, mut stdout: BufReader<ChildStdout>) {
        loop {
            match read_frame::<_, ExtensionMessage>(&mut stdout) {
                Ok(Some(ExtensionMessage::Response { id, response })) => {
                    match self.pending.remove(&id) {
                        Some((_, tx)) => {
                            let _ = tx.send(Inbound::Response(response));
                        }
                        None => debug!(extension = %self.label, id, "Response for unknown request"),
                    }
                }
                Ok(Some(ExtensionMessage::MemoryRequest { id, broker, request })) => {
                    let inbox = self.brokers.get(&broker).map(|entry| entry.value().clone());
                    let request = match inbox {
                        Some(tx) => match tx.send(Inbound::Memory { id, request }) {
                            Ok(()) => continue,
                            Err(e) => match e.into_inner() {
                                Inbound::Memory { request, .. } => request,
                                Inbound::Response(_) => continue,
                            },
                        },
                        None => request,
                    };
                    warn!(extension = %self.label, %broker, "Memory request for unknown broker");
                    let reply = request.failed(IoStatus::Other);
                    if self.send(&HostMessage::MemoryReply { id, reply }).is_err() {
                        break;
                    }
                }
                Ok(Some(ExtensionMessage::Handshake(_))) => {
                    warn!(extension = %self.label, "Unexpected handshake on established link");
                }
                Ok(None) => {
                    debug!(extension = %self.label, "Extension closed its output");
                    break;
                }
                Err(e) => {
                    warn!(extension = %self.label, error = %e, "Failed to read from extension");
                    break;
                }
            }
        }
        self.mark_closed();
    }
}

/// Removes a pending request when its caller stops waiting.
struct PendingGuard<'a> {
    link: &'a Link,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.link.pending.remove(&self.id);
    }
}

/// Tears down a call's memory broker when the call ends.
struct BrokerGuard<'a> {
    link: &'a Link,
    broker: BrokerId,
}

impl Drop for BrokerGuard<'_> {
    fn drop(&mut self) {
        self.link.brokers.remove(&self.broker);
    }
}

fn request_label(request: &Request) -> String {
    match request {
        Request::Symbols => "symbols".to_string(),
        Request::Meta => "meta".to_string(),
        Request::Attach { instance } => format!("attach({instance})"),
        Request::Release { instance } => format!("release({instance})"),
        Request::Call(call) => call.function.clone(),
    }
}

/// A running extension child and the link to it.
pub(crate) struct Connection {
    child: Mutex<Child>,
    link: Arc<Link>,
    pid: u32,
}

impl Connection {
    /// Spawn `binary` and complete the handshake.
    pub(crate) fn spawn(binary: &Path, config: &BridgeConfig) -> BridgeResult<Self> {
        let mut command = Command::new(binary);
        command
            .env(MAGIC_ENV, MAGIC)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = spawn_with_retry(&mut command).map_err(|source| BridgeError::SpawnFailed {
            path: binary.to_path_buf(),
            source,
        })?;
        let pid = child.id();

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                terminate(&mut child);
                return Err(BridgeError::Protocol("child pipes unavailable".to_string()));
            }
        };

        let label = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| binary.display().to_string());
        let link = Arc::new(Link::new(label, stdin));

        let mut stdout = BufReader::new(stdout);
        let (handshake_tx, handshake_rx) = bounded(1);
        let reader = Arc::clone(&link);
        let spawned = thread::Builder::new()
            .name(format!("orbit-link-{pid}"))
            .spawn(move || {
                let outcome = read_handshake(&mut stdout);
                let accepted = outcome.is_ok();
                let _ = handshake_tx.send(outcome);
                if accepted {
                    reader.read_loop(stdout);
                } else {
                    reader.mark_closed();
                }
            });
        if let Err(e) = spawned {
            terminate(&mut child);
            return Err(BridgeError::Io(e));
        }

        let verdict = match handshake_rx.recv_timeout(config.handshake_timeout) {
            Ok(verdict) => verdict,
            Err(_) => Err(format!(
                "no handshake within {:?}",
                config.handshake_timeout
            )),
        };

        if let Err(reason) = verdict {
            link.mark_closed();
            terminate(&mut child);
            warn!(binary = %binary.display(), pid, %reason, "Extension handshake failed");
            return Err(BridgeError::IncompatibleExtension(reason));
        }

        info!(binary = %binary.display(), pid, "Extension connected");
        Ok(Self {
            child: Mutex::new(child),
            link,
            pid,
        })
    }

    /// The RPC link.
    pub(crate) fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// OS process id of the child.
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the child has exited or its link has broken.
    pub(crate) fn has_exited(&self) -> bool {
        if self.link.is_closed() {
            return true;
        }
        matches!(self.child.lock().try_wait(), Ok(Some(_)) | Err(_))
    }

    /// Kill the child and fail anything still waiting on it.
    pub(crate) fn kill(&self) {
        self.link.mark_closed();
        terminate(&mut self.child.lock());
        debug!(pid = self.pid, "Extension process terminated");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.kill();
    }
}

fn read_handshake(stdout: &mut BufReader<ChildStdout>) -> Result<(), String> {
    match read_frame::<_, ExtensionMessage>(stdout) {
        Ok(Some(ExtensionMessage::Handshake(header))) => {
            header.validate().map_err(|e| e.to_string())
        }
        Ok(Some(_)) => Err("first frame was not a handshake".to_string()),
        Ok(None) => Err("process exited before handshake".to_string()),
        Err(e) => Err(format!("unreadable handshake: {e}")),
    }
}

fn terminate(child: &mut Child) {
    if let Ok(None) = child.try_wait() {
        let _ = child.kill();
    }
    let _ = child.wait();
}

fn spawn_with_retry(command: &mut Command) -> std::io::Result<Child> {
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Err(e) if is_text_busy(&e) && attempt < SPAWN_ATTEMPTS => {
                debug!(attempt, "Binary busy, retrying spawn");
                thread::sleep(Duration::from_millis(25 * u64::from(attempt)));
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(unix)]
fn is_text_busy(err: &std::io::Error) -> bool {
    // ETXTBSY on Linux and the BSDs.
    err.raw_os_error() == Some(26)
}

#[cfg(not(unix))]
fn is_text_busy(_err: &std::io::Error) -> bool {
    false
}

