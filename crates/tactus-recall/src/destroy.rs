//! Off-realtime destruction of swept instances.

use crate::instance::RecallInstance;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tactus_core::AtomicCounter;

enum DestroyCommand {
    Destroy(Arc<RecallInstance>),
    Shutdown,
}

/// Background thread that drops removed instances so processor state is
/// never freed on a worker thread.
pub(crate) struct DestroyWorker {
    tx: Sender<DestroyCommand>,
    rx: Option<Receiver<DestroyCommand>>,
    handle: Option<JoinHandle<()>>,
    destroyed: Arc<AtomicCounter>,
}

impl DestroyWorker {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx: Some(rx),
            handle: None,
            destroyed: Arc::new(AtomicCounter::default()),
        }
    }

    /// Spawns the thread. If spawning fails, instances are dropped inline.
    pub(crate) fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let Some(rx) = self.rx.take() else {
            return;
        };
        let destroyed = Arc::clone(&self.destroyed);

        let spawned = thread::Builder::new()
            .name("tactus-destroy".into())
            .spawn(move || destroy_loop(rx, destroyed));

        match spawned {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => tracing::error!("Failed to spawn destroy thread, destroying inline: {}", e),
        }
    }

    pub(crate) fn destroy(&self, instance: Arc<RecallInstance>) {
        if self.handle.is_none() {
            drop(instance);
            self.destroyed.incr();
            return;
        }
        if let Err(e) = self.tx.send(DestroyCommand::Destroy(instance)) {
            drop(e);
            self.destroyed.incr();
        }
    }

    pub(crate) fn destroyed(&self) -> u64 {
        self.destroyed.get()
    }

    pub(crate) fn stop(&mut self) {
        let _ = self.tx.send(DestroyCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DestroyWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn destroy_loop(rx: Receiver<DestroyCommand>, destroyed: Arc<AtomicCounter>) {
    for command in rx {
        match command {
            DestroyCommand::Destroy(instance) => {
                tracing::trace!(key = ?instance.key(), "Destroying recall instance");
                drop(instance);
                destroyed.incr();
            }
            DestroyCommand::Shutdown => break,
        }
    }
}
