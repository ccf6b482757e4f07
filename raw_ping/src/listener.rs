//! The background reader shared by every probe of one pinger.

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::ping::PingError;
use crate::transport::{Datagram, Sender, Source};

/// Consumer of the datagrams read by a [`Listener`].
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, datagram: Datagram);

    /// The listener ended without being asked to: too many consecutive read
    /// errors, or a panic.
    fn abort(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct LoopPolicy {
    pub poll_interval: Duration,
    pub max_consecutive_errors: Option<u32>,
}

impl From<&Config> for LoopPolicy {
    fn from(conf: &Config) -> Self {
        Self {
            poll_interval: conf.poll_interval(),
            max_consecutive_errors: conf.max_consecutive_read_errors,
        }
    }
}

/// Handle on the reader thread. Dropping it asks the thread to stop without waiting.
#[derive(Debug)]
pub struct Listener {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Listener {
    pub fn spawn<S, D>(
        name: &str,
        source: S,
        dispatcher: Arc<D>,
        policy: LoopPolicy,
    ) -> Result<Self, PingError>
    where
        S: Source,
        D: Dispatch,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(source, dispatcher, flag, policy))
            .map_err(PingError::Spawn)?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn signal(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signals the thread and blocks until it has exited, at most about one poll interval.
    pub fn join(mut self) {
        self.signal();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("listener thread panicked");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Releases the send half, then stops the listener and waits for it off the
/// async runtime. The socket itself closes when the listener drops its half.
///
/// Returns `false` if the listener had already been taken by an earlier call.
pub async fn shutdown(sender: &Sender, listener: &Mutex<Option<Listener>>) -> bool {
    sender.close();
    let listener = listener.lock().take();
    match listener {
        Some(listener) => {
            listener.signal();
            if tokio::task::spawn_blocking(move || listener.join())
                .await
                .is_err()
            {
                error!("listener join task failed");
            }
            true
        }
        None => false,
    }
}

/// Aborts the dispatcher when the loop ends without having been asked to stop,
/// including by unwinding.
struct ExitGuard<'a, D: Dispatch> {
    dispatcher: &'a D,
    stop: &'a AtomicBool,
}

impl<D: Dispatch> Drop for ExitGuard<'_, D> {
    fn drop(&mut self) {
        if self.stop.load(Ordering::Acquire) {
            return;
        }
        if thread::panicking() {
            error!("listener thread panicked, failing pending probes");
        }
        self.dispatcher.abort();
    }
}

fn run<S: Source, D: Dispatch>(
    mut source: S,
    dispatcher: Arc<D>,
    stop: Arc<AtomicBool>,
    policy: LoopPolicy,
) {
    let _guard = ExitGuard {
        dispatcher: &*dispatcher,
        stop: &stop,
    };
    let mut consecutive_errors = 0u32;
    while !stop.load(Ordering::Acquire) {
        match source.receive(policy.poll_interval) {
            Ok(Some(datagram)) => {
                consecutive_errors = 0;
                dispatcher.dispatch(datagram);
            }
            Ok(None) => consecutive_errors = 0,
            Err(e) if is_idle(&e) => consecutive_errors = 0,
            Err(e) => {
                consecutive_errors += 1;
                warn!(error = %e, consecutive_errors, "raw socket read failed");
                if let Some(max) = policy.max_consecutive_errors {
                    if consecutive_errors >= max {
                        error!(consecutive_errors, "too many read errors, stopping listener");
                        return;
                    }
                }
            }
        }
    }
    debug!("listener stopped");
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
