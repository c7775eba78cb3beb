use crate::error::{Error, Result};
use crate::events::{Event, StatusSink};
use crate::protocol::{GpsFix, Protocol, ProtocolConfig, SampleBlock};
use crate::watchdog::{Heartbeat, Watchdog};
use crate::writer::BlockQueue;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const THREAD_NAME: &str = "worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Unprepared,
    Preparing,
    Prepared,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkerState::Unprepared => "unprepared",
            WorkerState::Preparing => "preparing",
            WorkerState::Prepared => "prepared",
            WorkerState::Running => "running",
            WorkerState::Paused => "paused",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub adc: ProtocolConfig,
    // GPS link; `None` runs without time fixes.
    pub gps: Option<ProtocolConfig>,
    pub autostart: bool,
    // How long `stop` waits for the polling thread.
    pub stop_timeout: Duration,
    pub command_timeout: Duration,
    pub idle_tick: Duration,
    pub gps_poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            adc: ProtocolConfig::default(),
            gps: None,
            autostart: false,
            stop_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(10),
            idle_tick: Duration::from_millis(50),
            gps_poll_interval: Duration::from_secs(1),
        }
    }
}

// Opens a protocol for a configuration; swapped out in tests.
pub type Opener = Box<dyn FnMut(&ProtocolConfig, &StatusSink) -> Result<Protocol> + Send>;

type Reply = Sender<Result<()>>;

enum Command {
    Prepare(Reply),
    Start(Reply),
    Pause(Reply),
    Resume(Reply),
    Stop(Reply),
    Shutdown(Sender<()>),
}

#[derive(Debug)]
pub struct Worker {
    tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
    sink: StatusSink,
    stop_timeout: Duration,
    command_timeout: Duration,
}

impl Worker {
    pub fn spawn(
        settings: WorkerSettings,
        sink: StatusSink,
        output: Option<BlockQueue>,
        watchdog: &Watchdog,
    ) -> Result<Self> {
        Self::spawn_with_opener(settings, sink, output, watchdog, Box::new(Protocol::open))
    }

    pub fn spawn_with_opener(
        settings: WorkerSettings,
        sink: StatusSink,
        output: Option<BlockQueue>,
        watchdog: &Watchdog,
        opener: Opener,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let stop_timeout = settings.stop_timeout;
        let command_timeout = settings.command_timeout;
        let heartbeat = watchdog.register(THREAD_NAME);
        let acquisition = Acquisition::new(settings, sink.clone(), output, opener, heartbeat);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || acquisition.run(rx))
            .map_err(|err| Error::watchdog(THREAD_NAME, format!("could not be started: {err}")))?;
        Ok(Self {
            tx,
            handle: Some(handle),
            sink,
            stop_timeout,
            command_timeout,
        })
    }

    pub fn prepare(&self) -> Result<()> {
        self.request(Command::Prepare, self.command_timeout, "prepare")
    }

    pub fn start(&self) -> Result<()> {
        self.request(Command::Start, self.command_timeout, "start")
    }

    pub fn pause(&self) -> Result<()> {
        self.request(Command::Pause, self.command_timeout, "pause")
    }

    pub fn resume(&self) -> Result<()> {
        self.request(Command::Resume, self.command_timeout, "resume")
    }

    // Stop acquisition and close the protocols.
    //
    // Fails with a watchdog error when the polling thread does not answer
    // within the stop timeout. The thread is left alone in that case.
    pub fn stop(&self) -> Result<()> {
        self.request(Command::Stop, self.stop_timeout, "stop")
    }

    pub fn shutdown(mut self) -> Result<()> {
        self.finish()
    }

    fn request(
        &self,
        command: impl FnOnce(Reply) -> Command,
        timeout: Duration,
        what: &str,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.tx
            .send(command(reply_tx))
            .map_err(|_| Error::watchdog(THREAD_NAME, "has exited"))?;
        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let err = Error::watchdog(
                    THREAD_NAME,
                    format!("did not answer {what} within {timeout:?}"),
                );
                self.sink.report(&err);
                Err(err)
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::watchdog(THREAD_NAME, "exited before answering"))
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(Command::Shutdown(done_tx)).is_err() {
            return join(handle);
        }
        match done_rx.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => join(handle),
            Err(RecvTimeoutError::Timeout) => {
                let err = Error::watchdog(
                    THREAD_NAME,
                    format!("did not shut down within {:?}", self.stop_timeout),
                );
                self.sink.report(&err);
                Err(err)
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            log::error!("{err}");
        }
    }
}

fn join(handle: JoinHandle<()>) -> Result<()> {
    handle
        .join()
        .map_err(|_| Error::watchdog(THREAD_NAME, "panicked"))
}

// Min/avg/max of per-block handling time.
#[derive(Debug, Default)]
struct HandlingTimes {
    count: u32,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl HandlingTimes {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = Some(self.min.map_or(elapsed, |min| min.min(elapsed)));
        self.max = self.max.max(elapsed);
    }

    fn report(&self, sink: &StatusSink) {
        let Some(min) = self.min else {
            sink.trace("No blocks were handled");
            return;
        };
        sink.info(format!(
            "Block handling time over {} blocks: min {min:?}, avg {:?}, max {:?}",
            self.count,
            self.total / self.count,
            self.max
        ));
    }
}

struct Acquisition {
    settings: WorkerSettings,
    sink: StatusSink,
    output: Option<BlockQueue>,
    opener: Opener,
    heartbeat: Heartbeat,
    state: WorkerState,
    adc: Option<Protocol>,
    gps: Option<Protocol>,
    last_gps_poll: Option<Instant>,
    total_samples: u64,
    blocks: u64,
    times: HandlingTimes,
}

impl Acquisition {
    fn new(
        settings: WorkerSettings,
        sink: StatusSink,
        output: Option<BlockQueue>,
        opener: Opener,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            settings,
            sink,
            output,
            opener,
            heartbeat,
            state: WorkerState::Unprepared,
            adc: None,
            gps: None,
            last_gps_poll: None,
            total_samples: 0,
            blocks: 0,
            times: HandlingTimes::default(),
        }
    }

    fn run(mut self, rx: Receiver<Command>) {
        log::debug!("Worker thread started");
        loop {
            self.heartbeat.beat();
            let command = if self.state == WorkerState::Running {
                match rx.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match rx.recv_timeout(self.settings.idle_tick) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };

            match command {
                Some(Command::Prepare(reply)) => self.answer(reply, Self::prepare),
                Some(Command::Start(reply)) => self.answer(reply, Self::start),
                Some(Command::Pause(reply)) => self.answer(reply, Self::pause),
                Some(Command::Resume(reply)) => self.answer(reply, Self::resume),
                Some(Command::Stop(reply)) => self.answer(reply, Self::stop),
                Some(Command::Shutdown(done)) => {
                    let _ = self.stop();
                    let _ = done.send(());
                    log::debug!("Worker thread stopped");
                    return;
                }
                None => {}
            }

            if self.state == WorkerState::Running {
                self.poll();
            }
        }
        let _ = self.stop();
        log::debug!("Worker thread stopped, handle dropped");
    }

    fn answer(&mut self, reply: Reply, action: fn(&mut Self) -> Result<()>) {
        let result = action(self);
        if let Err(err) = &result {
            self.sink.report(err);
        }
        if reply.send(result).is_err() {
            log::debug!("Worker command reply dropped, caller gave up waiting");
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            log::debug!("Worker state {} -> {state}", self.state);
            self.state = state;
            self.sink.publish(Event::State(state));
        }
    }

    fn prepare(&mut self) -> Result<()> {
        match self.state {
            WorkerState::Unprepared | WorkerState::Stopped | WorkerState::Failed => {}
            WorkerState::Preparing | WorkerState::Prepared => {
                return Err(Error::State("prepare called twice".to_string()));
            }
            other => {
                return Err(Error::State(format!("cannot prepare while {other}")));
            }
        }
        self.set_state(WorkerState::Preparing);
        self.total_samples = 0;
        self.blocks = 0;
        self.times = HandlingTimes::default();
        self.last_gps_poll = None;

        let mut adc = match (self.opener)(&self.settings.adc, &self.sink) {
            Ok(adc) => adc,
            Err(err) => {
                self.set_state(WorkerState::Failed);
                return Err(err);
            }
        };
        if let Err(err) = adc.check_ready() {
            adc.close();
            self.set_state(WorkerState::Failed);
            return Err(err);
        }
        self.sink.info(format!("{} is ready", adc.description()));
        self.adc = Some(adc);

        self.gps = self.prepare_gps();
        self.set_state(WorkerState::Prepared);

        if self.settings.autostart {
            return self.start();
        }
        Ok(())
    }

    // GPS trouble is never fatal; acquisition goes on without fixes.
    fn prepare_gps(&mut self) -> Option<Protocol> {
        let config = self.settings.gps.clone()?;
        let mut gps = match (self.opener)(&config, &self.sink) {
            Ok(gps) => gps,
            Err(err) => {
                self.sink.warning(format!("GPS unavailable: {err}"));
                self.sink.publish(Event::GpsUnavailable);
                return None;
            }
        };
        if let Err(err) = gps.check_gps() {
            gps.close();
            self.sink.warning(format!("GPS unavailable: {err}"));
            self.sink.publish(Event::GpsUnavailable);
            return None;
        }
        self.sink.info(format!("GPS on {} is ready", gps.description()));
        if let Some(fix) = gps.read_gps_fix() {
            self.publish_fix(fix);
        }
        Some(gps)
    }

    fn start(&mut self) -> Result<()> {
        match self.state {
            WorkerState::Prepared => {}
            WorkerState::Running | WorkerState::Paused => {
                return Err(Error::State("already started".to_string()));
            }
            _ => return Err(Error::State("not prepared".to_string())),
        }
        let Some(adc) = self.adc.as_mut() else {
            return Err(Error::State("not prepared".to_string()));
        };
        if let Err(err) = adc.start_receiving() {
            self.close_protocols();
            self.set_state(WorkerState::Failed);
            return Err(err);
        }
        self.sink.info(format!(
            "Acquisition started at {} Hz",
            self.settings.adc.sampling_frequency
        ));
        self.set_state(WorkerState::Running);
        Ok(())
    }

    // The ADC stops streaming; the GPS link stays open.
    fn pause(&mut self) -> Result<()> {
        match self.state {
            WorkerState::Running => {}
            WorkerState::Paused => return Ok(()),
            other => return Err(Error::State(format!("cannot pause while {other}"))),
        }
        if let Some(adc) = self.adc.as_mut()
            && let Err(err) = adc.stop_receiving()
        {
            self.abort_session();
            return Err(err);
        }
        self.set_state(WorkerState::Paused);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        match self.state {
            WorkerState::Paused => {}
            WorkerState::Running => return Ok(()),
            other => return Err(Error::State(format!("cannot resume while {other}"))),
        }
        if let Some(adc) = self.adc.as_mut()
            && let Err(err) = adc.start_receiving()
        {
            self.abort_session();
            return Err(err);
        }
        self.set_state(WorkerState::Running);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        match self.state {
            WorkerState::Running | WorkerState::Paused => {
                let receiving = self.state == WorkerState::Running;
                self.set_state(WorkerState::Stopping);
                if receiving
                    && let Some(adc) = self.adc.as_mut()
                    && let Err(err) = adc.stop_receiving()
                {
                    self.sink
                        .warning(format!("Stopping {} failed: {err}", adc.description()));
                }
                self.close_protocols();
                self.finish_session();
                self.set_state(WorkerState::Stopped);
            }
            WorkerState::Prepared => {
                self.close_protocols();
                self.set_state(WorkerState::Stopped);
            }
            WorkerState::Unprepared
            | WorkerState::Preparing
            | WorkerState::Stopping
            | WorkerState::Stopped
            | WorkerState::Failed => {}
        }
        Ok(())
    }

    fn poll(&mut self) {
        let Some(adc) = self.adc.as_mut() else {
            return;
        };
        match adc.read() {
            Ok(Some(block)) => self.publish_block(block),
            Ok(None) => {}
            Err(err) => {
                self.sink.report(&err);
                self.abort_session();
                return;
            }
        }

        let due = self
            .last_gps_poll
            .is_none_or(|last| last.elapsed() >= self.settings.gps_poll_interval);
        if due && let Some(gps) = self.gps.as_mut() {
            self.last_gps_poll = Some(Instant::now());
            if let Some(fix) = gps.read_gps_fix() {
                self.publish_fix(fix);
            }
        }
    }

    // Display first, then the writer queue; both see blocks in read order.
    fn publish_block(&mut self, block: SampleBlock) {
        let started = Instant::now();
        self.total_samples += block.len() as u64;
        self.blocks += 1;
        self.sink.publish(Event::Samples {
            block: block.clone(),
            stats: block.stats(),
            total_samples: self.total_samples,
        });
        if let Some(queue) = &self.output
            && let Err(err) = queue.enqueue(block)
        {
            self.sink.report(&err);
        }
        self.times.record(started.elapsed());
    }

    fn publish_fix(&self, fix: GpsFix) {
        self.sink.trace(format!(
            "GPS fix: week {} tow {} s, {:.6} {:.6} {:.1} m",
            fix.week, fix.time_of_week, fix.latitude, fix.longitude, fix.altitude
        ));
        self.sink.publish(Event::GpsFix(fix));
    }

    fn abort_session(&mut self) {
        self.close_protocols();
        self.finish_session();
        self.set_state(WorkerState::Failed);
    }

    fn close_protocols(&mut self) {
        if let Some(mut adc) = self.adc.take() {
            adc.close();
        }
        if let Some(mut gps) = self.gps.take() {
            gps.close();
        }
    }

    fn finish_session(&mut self) {
        self.sink.info(format!(
            "Acquisition finished: {} samples in {} blocks",
            self.total_samples, self.blocks
        ));
        self.times.report(&self.sink);
        self.sink.publish(Event::Finished {
            total_samples: self.total_samples,
            blocks: self.blocks,
        });
    }
}
