// Copyright 2025 Tomoki Hayashi
// MIT License (https://opensource.org/licenses/MIT)

//! Adjacent-page prefetching.
//!
//! The controller drives a `Prefetcher` after every buffer update. `ImagePrefetcher` runs a
//! dedicated coordinator thread that reads image headers in parallel using rayon, so page
//! sizes are usually known before the page scrolls into view.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use log::debug;
use rayon::prelude::*;

use crate::window::ImageSize;

/// Warm-up collaborator for the pages around the reading position.
pub trait Prefetcher: Send {
    /// Replace any running batch with `urls`.
    fn start(&mut self, urls: Vec<String>);
    fn stop(&mut self);
}

/// Epoch-based cancellation token.
/// Incremented on every `start`/`stop` to invalidate in-flight batches.
struct PrefetchEpoch(AtomicU64);

impl PrefetchEpoch {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Measured header of a prefetched page.
#[derive(Clone, Debug, PartialEq)]
pub struct PrefetchResult {
    pub url: String,
    pub size: ImageSize,
}

enum PrefetchCommand {
    Batch { urls: Vec<String>, epoch: u64 },
    Shutdown,
}

/// Sending half, handed to the controller.
pub struct ImagePrefetcher {
    command_tx: Sender<PrefetchCommand>,
    epoch: Arc<PrefetchEpoch>,
    _handle: JoinHandle<()>,
}

/// Receiving half, polled by the UI loop.
pub struct PrefetchResults {
    result_rx: Receiver<(u64, PrefetchResult)>,
    epoch: Arc<PrefetchEpoch>,
}

impl PrefetchResults {
    /// Poll for measured pages of the current batch, discarding stale ones.
    pub fn try_recv(&self) -> Option<PrefetchResult> {
        let current = self.epoch.current();
        while let Ok((epoch, result)) = self.result_rx.try_recv() {
            if epoch >= current {
                return Some(result);
            }
        }
        None
    }
}

impl ImagePrefetcher {
    pub fn spawn(thread_count: usize) -> (Self, PrefetchResults) {
        let (command_tx, command_rx) = mpsc::channel::<PrefetchCommand>();
        let (result_tx, result_rx) = mpsc::channel::<(u64, PrefetchResult)>();
        let epoch = Arc::new(PrefetchEpoch::new());
        let epoch_clone = Arc::clone(&epoch);

        let handle = thread::spawn(move || {
            Self::coordinator_loop(command_rx, result_tx, epoch_clone, thread_count);
        });

        let results = PrefetchResults {
            result_rx,
            epoch: Arc::clone(&epoch),
        };
        let prefetcher = Self {
            command_tx,
            epoch,
            _handle: handle,
        };
        (prefetcher, results)
    }

    /// Read only the image header. Remote URLs are left to the image layer.
    pub fn measure(url: &str) -> Option<ImageSize> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        if path.contains("://") {
            return None;
        }
        let (width, height) = image::image_dimensions(Path::new(path)).ok()?;
        ImageSize::new(width, height)
    }

    fn coordinator_loop(
        command_rx: Receiver<PrefetchCommand>,
        result_tx: Sender<(u64, PrefetchResult)>,
        epoch: Arc<PrefetchEpoch>,
        thread_count: usize,
    ) {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(thread_count)
            .build()
            .expect("Failed to create prefetch thread pool");

        while let Ok(cmd) = command_rx.recv() {
            match cmd {
                PrefetchCommand::Batch {
                    urls,
                    epoch: request_epoch,
                } => {
                    if request_epoch < epoch.current() {
                        continue; // Stale batch
                    }
                    pool.install(|| {
                        urls.par_iter().for_each(|url| {
                            if epoch.current() > request_epoch {
                                return; // Cancelled
                            }
                            let Some(size) = Self::measure(url) else {
                                return;
                            };
                            if epoch.current() <= request_epoch {
                                let _ = result_tx.send((
                                    request_epoch,
                                    PrefetchResult {
                                        url: url.clone(),
                                        size,
                                    },
                                ));
                            }
                        });
                    });
                }
                PrefetchCommand::Shutdown => break,
            }
        }
    }
}

impl Prefetcher for ImagePrefetcher {
    fn start(&mut self, urls: Vec<String>) {
        let epoch = self.epoch.increment();
        debug!("prefetch batch {epoch}: {} pages", urls.len());
        let _ = self.command_tx.send(PrefetchCommand::Batch { urls, epoch });
    }

    fn stop(&mut self) {
        self.epoch.increment();
    }
}

impl Drop for ImagePrefetcher {
    fn drop(&mut self) {
        let _ = self.command_tx.send(PrefetchCommand::Shutdown);
    }
}
