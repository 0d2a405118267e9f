//! Release of the image when the process gets interrupted

use core::sync::atomic::{AtomicBool, Ordering};
use std::{
    io, process,
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use log::{debug, error, info};
use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::{Handle, Signals},
};

use crate::engine::Engine;

/// Exit status offset of a process killed by a signal
const SIGNAL_EXIT_BASE: i32 = 128;

const TERMINATION_SIGNALS: [i32; 3] = [SIGHUP, SIGINT, SIGTERM];

/// Releases and cleans up an [`Engine`] when a `SIGHUP`, `SIGINT` or
/// `SIGTERM` is received, then exits.
///
/// Steps in progress are never interrupted: the release waits for the engine
/// lock. Signals are only handled while the guard is alive.
#[derive(Debug)]
pub struct InterruptGuard {
    handle: Handle,
    thread: Option<thread::JoinHandle<()>>,
    triggered: Arc<AtomicBool>,
}

impl InterruptGuard {
    /// Starts watching for signals on behalf of `engine`
    ///
    /// # Errors
    ///
    /// If the signal handlers can't be registered
    pub fn new(engine: Arc<Mutex<Engine>>) -> Result<Self, io::Error> {
        Self::watch(engine, &TERMINATION_SIGNALS, exit_after)
    }

    fn watch(
        engine: Arc<Mutex<Engine>>,
        signals: &[i32],
        on_released: fn(i32),
    ) -> Result<Self, io::Error> {
        let mut signals = Signals::new(signals)?;
        let handle = signals.handle();
        let triggered = Arc::new(AtomicBool::new(false));
        let thread_triggered = Arc::clone(&triggered);

        let thread = thread::Builder::new()
            .name("vapdisk-signals".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    if release_once(&engine, &thread_triggered, signal) {
                        on_released(signal);
                    }
                }

                debug!("Signal watch over");
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
            triggered,
        })
    }

    /// Has a signal been caught?
    #[must_use]
    pub fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

/// Cleans `engine` up, unless it has already been done on behalf of an
/// earlier signal. Returns whether the cleanup ran.
fn release_once(engine: &Mutex<Engine>, triggered: &AtomicBool, signal: i32) -> bool {
    if triggered.swap(true, Ordering::SeqCst) {
        debug!("Ignoring signal {signal}, the image is already being released");
        return false;
    }

    info!("Caught signal {signal}, releasing the image");

    let mut engine = engine.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = engine.cleanup() {
        error!("Couldn't release the image: {e}");
    }

    true
}

#[allow(clippy::exit)]
fn exit_after(signal: i32) {
    process::exit(SIGNAL_EXIT_BASE + signal);
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.handle.close();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Signal thread panicked");
            }
        }
    }
}
