use crate::events::{Event, StatusSink};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// Marks a heartbeat whose thread has exited.
const RETIRED: u64 = u64::MAX;

#[derive(Debug)]
struct Monitored {
    name: String,
    last_beat_ms: Arc<AtomicU64>,
}

// Beat handle owned by one monitored thread. Dropping it retires the thread.
#[derive(Debug)]
pub struct Heartbeat {
    epoch: Instant,
    last_beat_ms: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn beat(&self) {
        self.last_beat_ms
            .store(elapsed_ms(self.epoch), Ordering::Relaxed);
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.last_beat_ms.store(RETIRED, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HungThread {
    pub name: String,
    pub silent_for: Duration,
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    epoch: Instant,
    window: Duration,
    monitored: Mutex<Vec<Monitored>>,
}

impl Watchdog {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                epoch: Instant::now(),
                window,
                monitored: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    // Start monitoring a thread; the returned heartbeat counts as a first beat.
    pub fn register(&self, name: &str) -> Heartbeat {
        let last_beat_ms = Arc::new(AtomicU64::new(elapsed_ms(self.inner.epoch)));
        if let Ok(mut monitored) = self.inner.monitored.lock() {
            monitored.retain(|entry| entry.last_beat_ms.load(Ordering::Relaxed) != RETIRED);
            monitored.push(Monitored {
                name: name.to_string(),
                last_beat_ms: Arc::clone(&last_beat_ms),
            });
        }
        Heartbeat {
            epoch: self.inner.epoch,
            last_beat_ms,
        }
    }

    // Threads silent for longer than the window. Retired threads are skipped.
    pub fn check(&self) -> Vec<HungThread> {
        let now_ms = elapsed_ms(self.inner.epoch);
        let Ok(monitored) = self.inner.monitored.lock() else {
            log::error!("Watchdog registry poisoned");
            return Vec::new();
        };
        monitored
            .iter()
            .filter_map(|entry| {
                let last = entry.last_beat_ms.load(Ordering::Relaxed);
                if last == RETIRED {
                    return None;
                }
                let silent_for = Duration::from_millis(now_ms.saturating_sub(last));
                (silent_for > self.inner.window).then(|| HungThread {
                    name: entry.name.clone(),
                    silent_for,
                })
            })
            .collect()
    }

    // Run `check` every `period` on a background thread, publishing
    // `Event::Hung` once per hang episode.
    pub fn spawn_supervisor(&self, period: Duration, sink: StatusSink) -> std::io::Result<Supervisor> {
        let watchdog = self.clone();
        let running = Arc::new(AtomicBool::new(true));
        let running_for_thread = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || supervise(watchdog, period, sink, running_for_thread))?;
        Ok(Supervisor {
            running,
            handle: Some(handle),
        })
    }
}

fn supervise(watchdog: Watchdog, period: Duration, sink: StatusSink, running: Arc<AtomicBool>) {
    let mut flagged: HashSet<String> = HashSet::new();
    while running.load(Ordering::SeqCst) {
        thread::sleep(period);
        let hung = watchdog.check();
        let names: HashSet<String> = hung.iter().map(|h| h.name.clone()).collect();

        for thread in hung {
            if flagged.contains(&thread.name) {
                continue;
            }
            sink.error(format!(
                "{} thread is hung: no heartbeat for {:?}",
                thread.name, thread.silent_for
            ));
            sink.publish(Event::Hung {
                thread: thread.name,
                silent_for: thread.silent_for,
            });
        }
        for name in flagged.difference(&names) {
            sink.info(format!("{name} thread responds again"));
        }
        flagged = names;
    }
}

// Handle to the supervisor thread; stops it on drop.
#[derive(Debug)]
pub struct Supervisor {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::error!("Watchdog supervisor panicked");
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn elapsed_ms(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(RETIRED - 1)
}
