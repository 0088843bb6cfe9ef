//! Typed NNG socket wrappers for the three PIE channels.
//!
//! The engine creates its socket files only once it has booted, so every
//! dial goes through a bounded retry loop. All wrappers are cheap to clone
//! (shared handle), thread-safe, and idempotent to close.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nng::options::Options;
use nng::{Protocol, Socket};
use thiserror::Error;

/// Default number of dial attempts before giving up.
pub const DIAL_ATTEMPTS: u32 = 50;

/// Default delay between dial attempts.
pub const DIAL_DELAY: Duration = Duration::from_millis(200);

/// Transport-layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A receive hit its deadline without a frame. The receive loop treats
    /// this as routine polling; everything else surfaces it.
    #[error("receive timed out")]
    Timeout,

    /// The socket has been closed.
    #[error("socket is closed")]
    Closed,

    #[error("failed to dial {url} after {attempts} attempts: {source}")]
    Dial {
        url: String,
        attempts: u32,
        source: nng::Error,
    },

    #[error("{op} failed: {source}")]
    Nng {
        op: &'static str,
        source: nng::Error,
    },
}

impl TransportError {
    fn from_recv(source: nng::Error) -> Self {
        match source {
            nng::Error::TimedOut => TransportError::Timeout,
            other => TransportError::Nng {
                op: "receive",
                source: other,
            },
        }
    }
}

type Result<T> = std::result::Result<T, TransportError>;

fn dial_with_retry(
    socket: &Socket,
    url: &str,
    attempts: u32,
    delay: Duration,
) -> Result<()> {
    let attempts = attempts.max(1);
    let mut last_error = nng::Error::Closed;

    for attempt in 0..attempts {
        match socket.dial(url) {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_error = e;
                if attempt + 1 < attempts {
                    std::thread::sleep(delay);
                }
            }
        }
    }

    Err(TransportError::Dial {
        url: url.to_string(),
        attempts,
        source: last_error,
    })
}

/// Shared, closeable socket handle.
#[derive(Clone)]
struct Handle {
    inner: Arc<Mutex<Option<Socket>>>,
}

impl Handle {
    fn new(socket: Socket) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(socket))),
        }
    }

    fn get(&self) -> Result<Socket> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::Closed)
    }

    fn close(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

/// Fan-in push socket: client → engine request submission.
#[derive(Clone)]
pub struct RequestSocket {
    handle: Handle,
}

impl RequestSocket {
    /// Open a push socket and dial the request endpoint with bounded retry.
    pub fn dial(url: &str, attempts: u32, delay: Duration) -> Result<Self> {
        let socket = Socket::new(Protocol::Push0).map_err(|e| TransportError::Nng {
            op: "open push socket",
            source: e,
        })?;
        dial_with_retry(&socket, url, attempts, delay)?;
        Ok(Self {
            handle: Handle::new(socket),
        })
    }

    /// Push one framed request. Lossless: NNG queues until the engine pulls.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let socket = self.handle.get()?;
        let msg = nng::Message::from(payload);
        socket.send(msg).map_err(|(_, e)| TransportError::Nng {
            op: "send",
            source: e,
        })
    }

    /// Close the socket. Safe to call more than once.
    pub fn close(&self) {
        self.handle.close();
    }
}

/// Fan-out subscribe socket: engine → client deltas and broadcast events.
///
/// Topic subscriptions must be registered before dialling, otherwise frames
/// published between dial and subscribe are dropped by the transport.
#[derive(Clone)]
pub struct SubscribeSocket {
    handle: Handle,
}

impl SubscribeSocket {
    /// Open a subscribe socket for `topics` and dial with bounded retry.
    pub fn dial(url: &str, topics: &[&[u8]], attempts: u32, delay: Duration) -> Result<Self> {
        let socket = Socket::new(Protocol::Sub0).map_err(|e| TransportError::Nng {
            op: "open subscribe socket",
            source: e,
        })?;

        for topic in topics {
            socket
                .set_opt::<nng::options::protocol::pubsub::Subscribe>(topic.to_vec())
                .map_err(|e| TransportError::Nng {
                    op: "subscribe",
                    source: e,
                })?;
        }

        dial_with_retry(&socket, url, attempts, delay)?;
        Ok(Self {
            handle: Handle::new(socket),
        })
    }

    /// Receive one frame, waiting at most `timeout`.
    pub fn recv(&self, timeout: Duration) -> Result<Vec<u8>> {
        let socket = self.handle.get()?;
        socket
            .set_opt::<nng::options::RecvTimeout>(Some(timeout))
            .map_err(|e| TransportError::Nng {
                op: "set receive timeout",
                source: e,
            })?;
        let msg = socket.recv().map_err(TransportError::from_recv)?;
        Ok(msg.as_slice().to_vec())
    }

    /// Close the socket. Safe to call more than once.
    pub fn close(&self) {
        self.handle.close();
    }
}

/// Synchronous request/reply socket for management commands.
///
/// REQ sockets allow one outstanding call at a time; the internal mutex is
/// held across the send/receive pair to serialize concurrent callers.
#[derive(Clone)]
pub struct ManagementSocket {
    handle: Handle,
    call: Arc<Mutex<()>>,
}

impl ManagementSocket {
    /// Open a request socket and dial the management endpoint.
    pub fn dial(url: &str, attempts: u32, delay: Duration) -> Result<Self> {
        let socket = Socket::new(Protocol::Req0).map_err(|e| TransportError::Nng {
            op: "open request socket",
            source: e,
        })?;
        dial_with_retry(&socket, url, attempts, delay)?;
        Ok(Self {
            handle: Handle::new(socket),
            call: Arc::new(Mutex::new(())),
        })
    }

    /// Send one command and block until the reply arrives or `timeout` lapses.
    pub fn call(&self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let _serial = self.call.lock().unwrap_or_else(|e| e.into_inner());
        let socket = self.handle.get()?;

        socket
            .set_opt::<nng::options::RecvTimeout>(Some(timeout))
            .map_err(|e| TransportError::Nng {
                op: "set receive timeout",
                source: e,
            })?;

        let msg = nng::Message::from(payload);
        socket.send(msg).map_err(|(_, e)| TransportError::Nng {
            op: "send command",
            source: e,
        })?;

        let reply = socket.recv().map_err(TransportError::from_recv)?;
        Ok(reply.as_slice().to_vec())
    }

    /// Close the socket. Safe to call more than once.
    pub fn close(&self) {
        self.handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_gives_up_after_bounded_attempts() {
        let url = "ipc:///nonexistent/grove-test/no-such-socket.ipc";
        let started = std::time::Instant::now();
        let result = RequestSocket::dial(url, 3, Duration::from_millis(10));

        match result {
            Err(TransportError::Dial { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected dial error, got {:?}", other.map(|_| ())),
        }
        // Two inter-attempt delays, not three.
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("ipc://{}/loop.ipc", dir.path().display());

        // A listener makes the dial succeed immediately.
        let listener = Socket::new(Protocol::Pull0).unwrap();
        listener.listen(&url).unwrap();

        let socket = RequestSocket::dial(&url, 2, Duration::from_millis(10)).unwrap();
        socket.close();
        socket.close();
        assert!(matches!(socket.send(b"x"), Err(TransportError::Closed)));
    }

    #[test]
    fn push_frames_reach_a_puller() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("ipc://{}/push.ipc", dir.path().display());

        let listener = Socket::new(Protocol::Pull0).unwrap();
        listener
            .set_opt::<nng::options::RecvTimeout>(Some(Duration::from_secs(5)))
            .unwrap();
        listener.listen(&url).unwrap();

        let socket = RequestSocket::dial(&url, 5, Duration::from_millis(20)).unwrap();
        socket.send(b"hello engine").unwrap();

        let msg = listener.recv().unwrap();
        assert_eq!(msg.as_slice(), b"hello engine");
    }

    #[test]
    fn recv_timeout_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("ipc://{}/sub.ipc", dir.path().display());

        let publisher = Socket::new(Protocol::Pub0).unwrap();
        publisher.listen(&url).unwrap();

        let socket =
            SubscribeSocket::dial(&url, &[b"topic:"], 5, Duration::from_millis(20)).unwrap();
        let result = socket.recv(Duration::from_millis(50));
        assert!(matches!(result, Err(TransportError::Timeout)));
    }
}
