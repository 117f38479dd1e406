use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt::Display;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use ax25core::frame::{Ax25Frame, Modulo};
use ax25core::kiss::{KissBuffer, KissCommand, KissFrame};
use log::debug;

use crate::error::Ax25Error;
use crate::tnc::Tnc;

/// Priority for DISC frames sent on abort; overtakes everything.
pub const PRIORITY_URGENT: u8 = 0;
/// Priority for control-plane frames: UA, DM, supervisory responses.
pub const PRIORITY_CONTROL: u8 = 1;
/// Default priority for I and UI frames.
pub const PRIORITY_DEFAULT: u8 = 5;
/// Lowest (numerically highest) priority accepted.
pub const PRIORITY_MAX: u8 = 10;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

/// Opaque identity of one transport; part of every connection's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// An AX.25 frame queued for transmission on a particular TNC port.
#[derive(Debug, Clone)]
pub struct ClientFrame {
    pub frame: Ax25Frame,
    pub port: u8,
    pub priority: u8,
}

impl ClientFrame {
    pub fn new(frame: Ax25Frame, port: u8, priority: u8) -> Result<Self, Ax25Error> {
        if port > 15 {
            return Err(Ax25Error::InvalidPort(port));
        }
        if priority > PRIORITY_MAX {
            return Err(Ax25Error::InvalidPriority(priority));
        }
        Ok(Self {
            frame,
            port,
            priority,
        })
    }
}

struct QueuedFrame {
    seq: u64,
    frame: ClientFrame,
}

impl PartialEq for QueuedFrame {
    fn eq(&self, other: &Self) -> bool {
        self.frame.priority == other.frame.priority && self.seq == other.seq
    }
}

impl Eq for QueuedFrame {}

impl PartialOrd for QueuedFrame {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedFrame {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the lowest (priority, arrival)
        // pair pops first, keeping FIFO order within a priority level.
        (other.frame.priority, other.seq).cmp(&(self.frame.priority, self.seq))
    }
}

struct TxQueue {
    heap: Mutex<BinaryHeap<QueuedFrame>>,
    available: Condvar,
    next_seq: AtomicU64,
}

/// Cloneable handle for enqueuing outbound frames on a client.
#[derive(Clone)]
pub struct ClientTx {
    queue: Arc<TxQueue>,
}

impl ClientTx {
    pub(crate) fn new() -> Self {
        Self {
            queue: Arc::new(TxQueue {
                heap: Mutex::new(BinaryHeap::new()),
                available: Condvar::new(),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn queue_frame(&self, frame: ClientFrame) {
        let seq = self.queue.next_seq.fetch_add(1, Ordering::Relaxed);
        self.queue.heap.lock().unwrap().push(QueuedFrame { seq, frame });
        self.queue.available.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn drain(&self) -> Vec<ClientFrame> {
        let mut heap = self.queue.heap.lock().unwrap();
        let mut out = Vec::with_capacity(heap.len());
        while let Some(entry) = heap.pop() {
            out.push(entry.frame);
        }
        out
    }
}

/// Route for inbound frames decoded by a client's reader thread.
pub type FrameRouter = Arc<dyn Fn(Ax25Frame, ClientId, u8) + Send + Sync>;

/// One KISS transport with its reader and writer workers.
///
/// The concrete TNC type is erased at construction; `start` hands the two
/// halves of it to the worker threads.
pub struct Ax25Client {
    id: ClientId,
    tx: ClientTx,
    stop: Arc<AtomicBool>,
    starter: Mutex<Option<Box<dyn FnOnce(FrameRouter) + Send>>>,
}

impl Ax25Client {
    pub fn new<T: Tnc>(mut tnc: T) -> Result<Self, Ax25Error> {
        let write_tnc = tnc.try_clone()?;
        let id = ClientId::next();
        let tx = ClientTx::new();
        let stop = Arc::new(AtomicBool::new(false));
        let starter: Box<dyn FnOnce(FrameRouter) + Send> = {
            let queue = tx.queue.clone();
            let stop = stop.clone();
            Box::new(move |router: FrameRouter| {
                let mut tnc = tnc;
                if let Err(e) = tnc.start() {
                    debug!("{}: transport failed to start: {}", id, e);
                    return;
                }
                spawn_reader(tnc, id, router, stop.clone());
                spawn_writer(write_tnc, id, queue, stop);
            })
        };
        Ok(Self {
            id,
            tx,
            stop,
            starter: Mutex::new(Some(starter)),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn tx(&self) -> ClientTx {
        self.tx.clone()
    }

    /// Spawn the reader and writer threads. Does nothing on a second call.
    pub(crate) fn start(&self, router: FrameRouter) {
        if let Some(starter) = self.starter.lock().unwrap().take() {
            debug!("{}: starting transport workers", self.id);
            starter(router);
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.tx.queue.available.notify_all();
    }
}

fn spawn_reader<T: Tnc>(mut tnc: T, id: ClientId, router: FrameRouter, stop: Arc<AtomicBool>) {
    thread::spawn(move || {
        let mut kiss_buffer = KissBuffer::new();
        let mut buf = [0u8; 1024];
        loop {
            if stop.load(Ordering::Acquire) {
                break;
            }
            let n = match tnc.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    debug!("{}: read failed: {}", id, e);
                    break;
                }
            };
            kiss_buffer.extend(&buf[..n]);
            while let Some(kiss_frame) = kiss_buffer.next_frame() {
                if kiss_frame.command != KissCommand::DataFrame {
                    continue;
                }
                match Ax25Frame::decode(&kiss_frame.data, Modulo::Mod8) {
                    Ok(frame) => router(frame, id, kiss_frame.port),
                    Err(e) => debug!(
                        "{}: dropping undecodable frame ({}): {:02x?}",
                        id, e, kiss_frame.data
                    ),
                }
            }
        }
        debug!("{} reader terminating", id);
    });
}

fn spawn_writer<T: Tnc>(mut tnc: T, id: ClientId, queue: Arc<TxQueue>, stop: Arc<AtomicBool>) {
    thread::spawn(move || {
        loop {
            // Drain whatever is queued before honouring a stop request, so
            // farewell frames still reach the wire.
            let next = {
                let mut heap = queue.heap.lock().unwrap();
                loop {
                    if let Some(entry) = heap.pop() {
                        break Some(entry);
                    }
                    if stop.load(Ordering::Acquire) {
                        break None;
                    }
                    let (guard, _) = queue
                        .available
                        .wait_timeout(heap, Duration::from_millis(100))
                        .unwrap();
                    heap = guard;
                }
            };
            let Some(entry) = next else { break };
            let ClientFrame { frame, port, .. } = entry.frame;
            let encoded = match frame.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("{}: cannot encode outgoing frame: {}", id, e);
                    continue;
                }
            };
            let kiss = match KissFrame::new(encoded, KissCommand::DataFrame, port) {
                Ok(kiss) => kiss,
                Err(e) => {
                    debug!("{}: cannot build KISS frame: {}", id, e);
                    continue;
                }
            };
            if let Err(e) = tnc.write_all(&kiss.encode()) {
                debug!("{}: write failed: {}", id, e);
                break;
            }
        }
        if let Err(e) = tnc.close() {
            debug!("{}: close failed: {}", id, e);
        }
        debug!("{} writer terminating", id);
    });
}
