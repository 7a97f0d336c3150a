//! The extension's side of the connection.
//!
//! [`serve`] writes the handshake to stdout and then answers host requests
//! read from stdin until the host closes the pipe. Every call runs on its
//! own thread so one slow handler never blocks another; control requests
//! are answered inline. Memory requests made by a handler are tagged with a
//! fresh id and the handler blocks until the matching reply arrives.
//!
//! Stdout belongs to the protocol. Handlers must log to stderr, which is
//! what [`init_logging`](crate::init_logging) sets up.

use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, bounded};
use dashmap::DashMap;
use orbit_core::protocol::{MAGIC, MAGIC_ENV};
use orbit_core::{
    BrokerId, ExtensionMessage, HandshakeHeader, HostMessage, MemoryReply, MemoryRequest,
    Request, Response, read_frame, write_frame,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::{ServeError, ServeResult};
use crate::memory::MemoryTransport;
use crate::registrar::Exports;

/// Serve `exports` over stdin and stdout.
///
/// Refuses to run unless the process was launched by an Orbit host.
pub fn serve(exports: Exports) -> ServeResult<()> {
    if std::env::var(MAGIC_ENV).ok().as_deref() != Some(MAGIC) {
        return Err(ServeError::NotLaunchedByHost);
    }
    serve_with(exports, io::stdin(), io::stdout())
}

/// Serve `exports` over an arbitrary stream pair.
///
/// Returns once `input` reaches end of stream and every in-flight call has
/// finished.
pub fn serve_with<R, W>(exports: Exports, input: R, output: W) -> ServeResult<()>
where
    R: Read,
    W: Write + Send + 'static,
{
    let exports = Arc::new(exports);
    let session = Arc::new(Session::new(Box::new(output)));
    session.send(&ExtensionMessage::Handshake(HandshakeHeader::current()))?;
    info!(extension = %exports.meta().name, exports = exports.len(), "Serving host");

    let mut input = BufReader::new(input);
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let result = loop {
        match read_frame::<_, HostMessage>(&mut input) {
            Ok(Some(HostMessage::Request { id, request })) => {
                if let Request::Call(_) = request {
                    let exports = Arc::clone(&exports);
                    let session = Arc::clone(&session);
                    let worker = thread::Builder::new()
                        .name(format!("orbit-call-{id}"))
                        .spawn(move || {
                            let transport: Arc<dyn MemoryTransport> = session.clone();
                            let response = exports.handle(request, transport);
                            session.respond(id, response);
                        })?;
                    workers.push(worker);
                } else {
                    let response = exports.handle(request, Arc::clone(&session) as Arc<dyn MemoryTransport>);
                    session.respond(id, response);
                }
            }
            Ok(Some(HostMessage::MemoryReply { id, reply })) => session.deliver(id, reply),
            Ok(None) => {
                debug!("Host closed the connection");
                break Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Failed to read from host");
                break Err(ServeError::Connection(e));
            }
        }
        workers.retain(|worker| !worker.is_finished());
    };

    session.close();
    for worker in workers {
        let _ = worker.join();
    }
    result
}

/// Shared state of one host connection.
struct Session {
    output: Mutex<Box<dyn Write + Send>>,
    pending: DashMap<u64, Sender<MemoryReply>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Session {
    fn new(output: Box<dyn Write + Send>) -> Self {
        Self {
            output: Mutex::new(output),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn send(&self, message: &ExtensionMessage) -> ServeResult<()> {
        let mut output = self.output.lock();
        write_frame(&mut *output, message)?;
        Ok(())
    }

    fn respond(&self, id: u64, response: Response) {
        if let Err(e) = self.send(&ExtensionMessage::Response { id, response }) {
            warn!(id, error = %e, "Failed to send response");
        }
    }

    fn deliver(&self, id: u64, reply: MemoryReply) {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
            }
            None => debug!(id, "Memory reply for unknown request"),
        }
    }

    /// Fail every handler still waiting on the host.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.clear();
    }
}

impl MemoryTransport for Session {
    fn exchange(&self, broker: BrokerId, request: MemoryRequest) -> io::Result<MemoryReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.pending.insert(id, tx);

        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&id);
            return Err(disconnected());
        }

        trace!(id, %broker, "Memory request");
        if let Err(e) = self.send(&ExtensionMessage::MemoryRequest { id, broker, request }) {
            self.pending.remove(&id);
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, e));
        }
        rx.recv().map_err(|_| disconnected())
    }
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "host connection closed")
}
