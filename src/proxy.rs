//! Thread-backed object server.
//!
//! [`ObjectServer::expose`] moves an object onto its own server thread and
//! returns a cloneable [`Proxy`]. Every call through a proxy becomes a typed
//! request on the object's channel; the server thread locks the object, runs
//! the request and sends the reply back. This is the only path through which
//! concurrent callers (dispatcher threads serving worker processes) touch the
//! object, so the object itself needs no synchronization.

use crate::error::TaskError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// How long a proxy call waits for its reply.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a server thread checks its stop flag while idle.
const SERVER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An object that can be served to other threads or processes.
pub trait RemoteObject: Send + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Name of the operation a request invokes, for diagnostics.
    fn method_name(request: &Self::Request) -> &'static str;

    /// Execute one request against the object.
    fn handle(&mut self, request: Self::Request) -> Result<Self::Response, TaskError>;
}

type Reply<T> = Result<<T as RemoteObject>::Response, TaskError>;
type Envelope<T> = (<T as RemoteObject>::Request, Sender<Reply<T>>);

/// Handle for calling methods on an object hosted by an [`ObjectServer`].
pub struct Proxy<T: RemoteObject> {
    requests: Sender<Envelope<T>>,
    timeout: Duration,
}

impl<T: RemoteObject> Clone for Proxy<T> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T: RemoteObject> Proxy<T> {
    /// Use a different reply timeout for this handle.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `request` to the server thread and wait for its reply.
    ///
    /// Fails with [`TaskError::NoResponse`] if the server is gone or does not
    /// answer within the timeout; an error returned by the object is passed
    /// through unchanged.
    pub fn call(&self, request: T::Request) -> Result<T::Response, TaskError> {
        let method = T::method_name(&request);
        let (reply_tx, reply_rx) = bounded(1);
        self.requests
            .send((request, reply_tx))
            .map_err(|_| TaskError::NoResponse(method.to_string()))?;
        match reply_rx.recv_timeout(self.timeout) {
            Ok(reply) => reply,
            Err(_) => Err(TaskError::NoResponse(method.to_string())),
        }
    }
}

/// Hosts exposed objects, one server thread each.
pub struct ObjectServer {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Default for ObjectServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectServer {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            threads: Vec::new(),
        }
    }

    /// Start serving `obj` and return a proxy for it.
    pub fn expose<T: RemoteObject>(&mut self, obj: T) -> std::io::Result<Proxy<T>> {
        let (tx, rx) = unbounded::<Envelope<T>>();
        let running = Arc::clone(&self.running);
        let name = format!("object-server-{}", self.threads.len());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || serve(Mutex::new(obj), rx, running))?;
        self.threads.push(handle);
        Ok(Proxy {
            requests: tx,
            timeout: CALL_TIMEOUT,
        })
    }

    /// Number of server threads started.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Stop all server threads and wait for them to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Object server thread panicked");
            }
        }
    }
}

impl Drop for ObjectServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve<T: RemoteObject>(obj: Mutex<T>, requests: Receiver<Envelope<T>>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let (request, reply_tx) = match requests.recv_timeout(SERVER_POLL_INTERVAL) {
            Ok(envelope) => envelope,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let reply = {
            let mut guard = obj.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            panic::catch_unwind(AssertUnwindSafe(|| guard.handle(request)))
                .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)))
        };

        // The caller may have timed out and dropped its receiver.
        let _ = reply_tx.send(reply);
    }
    debug!("Object server thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        value: i64,
    }

    enum CounterOp {
        Add(i64),
        Get,
        Fail,
        Panic,
        Sleep(Duration),
    }

    impl RemoteObject for Counter {
        type Request = CounterOp;
        type Response = i64;

        fn method_name(request: &CounterOp) -> &'static str {
            match request {
                CounterOp::Add(_) => "add",
                CounterOp::Get => "get",
                CounterOp::Fail => "fail",
                CounterOp::Panic => "panic",
                CounterOp::Sleep(_) => "sleep",
            }
        }

        fn handle(&mut self, request: CounterOp) -> Result<i64, TaskError> {
            match request {
                CounterOp::Add(n) => {
                    self.value += n;
                    Ok(self.value)
                }
                CounterOp::Get => Ok(self.value),
                CounterOp::Fail => Err(TaskError::Routine("counter refused".into())),
                CounterOp::Panic => panic!("counter exploded"),
                CounterOp::Sleep(d) => {
                    thread::sleep(d);
                    Ok(self.value)
                }
            }
        }
    }

    #[test]
    fn test_calls_are_serialized() {
        let mut server = ObjectServer::new();
        let proxy = server.expose(Counter { value: 0 }).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = proxy.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        p.call(CounterOp::Add(1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(proxy.call(CounterOp::Get).unwrap(), 800);
        server.stop();
    }

    #[test]
    fn test_error_is_reraised() {
        let mut server = ObjectServer::new();
        let proxy = server.expose(Counter { value: 0 }).unwrap();
        assert_eq!(
            proxy.call(CounterOp::Fail),
            Err(TaskError::Routine("counter refused".into()))
        );
        // The server keeps running after a failed call.
        assert_eq!(proxy.call(CounterOp::Add(2)).unwrap(), 2);
    }

    #[test]
    fn test_panic_becomes_error() {
        let mut server = ObjectServer::new();
        let proxy = server.expose(Counter { value: 0 }).unwrap();
        assert!(matches!(
            proxy.call(CounterOp::Panic),
            Err(TaskError::Panicked(_))
        ));
        assert_eq!(proxy.call(CounterOp::Get).unwrap(), 0);
    }

    #[test]
    fn test_no_response_timeout() {
        let mut server = ObjectServer::new();
        let proxy = server
            .expose(Counter { value: 0 })
            .unwrap()
            .with_timeout(Duration::from_millis(20));
        assert_eq!(
            proxy.call(CounterOp::Sleep(Duration::from_millis(200))),
            Err(TaskError::NoResponse("sleep".into()))
        );
    }

    #[test]
    fn test_call_after_stop_fails() {
        let mut server = ObjectServer::new();
        let proxy = server
            .expose(Counter { value: 0 })
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        assert_eq!(server.len(), 1);
        server.stop();
        assert!(server.is_empty());
        assert!(matches!(
            proxy.call(CounterOp::Get),
            Err(TaskError::NoResponse(_))
        ));
    }
}
