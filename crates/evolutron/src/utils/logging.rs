use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use tqdm::tqdm;
use tqdm::Tqdm;

/// Progress bar driven from any thread; updates are funnelled through a
/// channel to a single thread that owns the `tqdm` bar.
pub struct Progress {
    total: usize,
    count: AtomicUsize,
    sender: mpsc::Sender<usize>,
    progress_thread: Option<thread::JoinHandle<()>>,
}

impl Progress {
    pub fn new(total: usize, description: &str) -> Self {
        let progress = Arc::new(Mutex::new(tqdm(0..total).desc(Some(description))));
        let (tx, rx) = mpsc::channel::<usize>();
        let progress_clone: Arc<Mutex<Tqdm<Range<usize>>>> = Arc::clone(&progress);

        let handle = thread::spawn(move || {
            for step in rx {
                if let Ok(mut bar) = progress_clone.lock() {
                    let _ = bar.pbar.update(step);
                }
            }
        });

        Self {
            total,
            count: AtomicUsize::new(0),
            sender: tx,
            progress_thread: Some(handle),
        }
    }

    /// Advances the bar by one step; steps past `total` are dropped.
    pub fn inc(&self) {
        let new_count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if new_count > self.total {
            log::debug!("Progress overflow ({} > {}), skipping update", new_count, self.total);
            return;
        }
        let _ = self.sender.send(1);
    }

    pub fn position(&self) -> usize {
        self.count.load(Ordering::Acquire).min(self.total)
    }

    /// Flushes pending updates and joins the drawing thread.
    pub fn finish(self) {
        let Progress {
            sender,
            progress_thread,
            ..
        } = self;
        drop(sender);
        if let Some(handle) = progress_thread {
            let _ = handle.join();
        }
    }
}
