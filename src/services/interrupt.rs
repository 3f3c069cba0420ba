//! Stop flag flipped by SIGINT/SIGTERM.
//!
//! The sync loop stays blocking; a helper thread drives a single-threaded
//! tokio runtime only to wait for signals.

use log::{error, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Spawn the signal watcher. A second signal exits immediately.
pub fn install() -> Result<StopFlag, String> {
    let flag = StopFlag::new();
    let watcher = flag.clone();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .map_err(|e| format!("failed to start signal runtime: {}", e))?;

    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            if let Err(e) = runtime.block_on(watch(watcher)) {
                error!("signal handler failed: {}", e);
            }
        })
        .map_err(|e| format!("failed to spawn signal watcher: {}", e))?;

    Ok(flag)
}

fn on_signal(flag: &StopFlag) {
    if flag.is_stopped() {
        warn!("Second interrupt received; exiting without saving");
        std::process::exit(130);
    }
    warn!("Interrupt received; finishing the current batch and saving the checkpoint");
    flag.request_stop();
}

#[cfg(unix)]
async fn watch(flag: StopFlag) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    loop {
        tokio::select! {
            _ = sigterm.recv() => on_signal(&flag),
            _ = sigint.recv() => on_signal(&flag),
        }
    }
}

#[cfg(not(unix))]
async fn watch(flag: StopFlag) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        on_signal(&flag);
    }
}
