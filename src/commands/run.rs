use crate::args::{RotationArg, RunArgs};
use crate::shared::lock::InstanceLock;
use crate::shared::signal::StopRequest;
use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use seismoreg::device_id::{load_device_id, parse_device_id};
use seismoreg::protocol::{BlockStats, CHANNELS, ProtocolConfig};
use seismoreg::watchdog::Watchdog;
use seismoreg::worker::{Worker, WorkerSettings, WorkerState};
use seismoreg::writer::{FileNameTemplate, FileWriter, Retention, RotationMode, WriterSettings};
use seismoreg::{Event, StatusSink};
use std::fs;
use std::time::{Duration, Instant};

const LOCK_FILE_NAME: &str = ".seismoreg.lock";

// Public run command entrypoint.
// One worker thread acquires, one writer thread persists; this thread watches events.
pub fn run_mode(args: RunArgs) -> Result<()> {
    let stop = StopRequest::install()?;

    fs::create_dir_all(&args.output_dir).with_context(|| {
        format!(
            "creating output directory failed: {}",
            args.output_dir.display()
        )
    })?;
    let lock_path = args
        .lock_file
        .clone()
        .unwrap_or_else(|| args.output_dir.join(LOCK_FILE_NAME));
    let _lock = InstanceLock::acquire(&lock_path)?;

    let (sink, events) = StatusSink::channel();
    let fallback_id = parse_device_id(&args.device_id).context("invalid --device-id")?;
    let device_id = match &args.device_id_file {
        Some(path) => load_device_id(path, &fallback_id, &sink),
        None => fallback_id,
    };

    let adc = protocol_config(&args, device_id);
    let gps = args.gps_port.as_ref().map(|port| adc.with_port(port));
    let template = FileNameTemplate::new(&args.prefix, &args.pattern, &args.suffix)
        .context("invalid file name template")?;

    let watchdog = Watchdog::new(Duration::from_millis(args.watchdog_window_ms.max(1)));
    let supervisor = watchdog
        .spawn_supervisor((watchdog.window() / 4).max(Duration::from_millis(50)), sink.clone())
        .context("starting watchdog supervisor failed")?;

    let writer = FileWriter::spawn(
        writer_settings(&args, template),
        adc.clone(),
        sink.clone(),
        &watchdog,
    )
    .context("starting file writer failed")?;
    let worker = Worker::spawn(
        WorkerSettings {
            adc,
            gps,
            autostart: true,
            stop_timeout: Duration::from_millis(args.stop_timeout_ms),
            ..WorkerSettings::default()
        },
        sink.clone(),
        Some(writer.queue()),
        &watchdog,
    )
    .context("starting acquisition worker failed")?;

    worker.prepare().context("preparing acquisition failed")?;
    eprintln!(
        "Recording from {} at {} Hz into {}",
        args.port,
        args.sampling_frequency,
        args.output_dir.display()
    );

    let mut monitor = Monitor::new();
    let outcome = monitor.watch(&args, &stop, &events, &writer);

    // Worker first so every block it read is queued before the writer drains.
    let stopped = worker.stop().context("stopping acquisition failed");
    let shut_down = worker.shutdown().context("acquisition thread did not exit");
    while let Ok(event) = events.try_recv() {
        monitor.observe(event);
    }
    let summary = writer.shutdown().context("file writer did not shut down")?;
    supervisor.stop();

    eprintln!(
        "Recorder stopped: {} samples in {} blocks, {} items in {} files, {} dropped, {} unwritten",
        monitor.total_samples,
        monitor.blocks,
        summary.items_written,
        summary.files_opened,
        summary.dropped_blocks,
        summary.unwritten_blocks
    );
    outcome.and(stopped).and(shut_down)
}

fn protocol_config(args: &RunArgs, device_id: String) -> ProtocolConfig {
    ProtocolConfig {
        port: args.port.clone(),
        baud_rate: args.baud_rate,
        data_bits: args.data_bits.into(),
        stop_bits: args.stop_bits.into(),
        parity: args.parity.into(),
        flow_control: args.flow_control.into(),
        sampling_frequency: args.sampling_frequency,
        filter_frequency: args.filter_frequency,
        device_id,
        read_timeout: Duration::from_millis(args.read_timeout_ms.max(1)),
        block_interval: Duration::from_millis(args.block_interval_ms),
        trace_raw: args.trace_raw,
        ..ProtocolConfig::default()
    }
}

fn writer_settings(args: &RunArgs, template: FileNameTemplate) -> WriterSettings {
    let mode = match args.rotation {
        RotationArg::Manual => RotationMode::Manual,
        RotationArg::ManualAuto => RotationMode::ManualAuto,
        RotationArg::Automatic => RotationMode::Automatic {
            interval: Duration::from_secs(args.rotation_interval_secs),
        },
    };
    let retention = match args.retain_blocks {
        Some(max_blocks) => Retention::DropOldest { max_blocks },
        None => Retention::Unbounded,
    };
    WriterSettings {
        directory: args.output_dir.clone(),
        template,
        mode,
        retention,
        ..WriterSettings::default()
    }
}

// Event consumer of the command line shell: counters plus periodic stats lines.
struct Monitor {
    started: Instant,
    last_stats: Instant,
    last_write_trigger: Instant,
    total_samples: u64,
    blocks: u64,
    items_written: u64,
    latest_stats: Option<BlockStats>,
    failure: Option<String>,
}

impl Monitor {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_stats: now,
            last_write_trigger: now,
            total_samples: 0,
            blocks: 0,
            items_written: 0,
            latest_stats: None,
            failure: None,
        }
    }

    fn watch(
        &mut self,
        args: &RunArgs,
        stop: &StopRequest,
        events: &Receiver<Event>,
        writer: &FileWriter,
    ) -> Result<()> {
        let duration = args.duration_secs.map(Duration::from_secs);
        let stats_interval =
            (args.stats_interval_secs > 0).then(|| Duration::from_secs(args.stats_interval_secs));
        let write_every = args.write_every_secs.map(|secs| Duration::from_secs(secs.max(1)));

        while !stop.is_requested() {
            if let Some(limit) = duration
                && self.started.elapsed() >= limit
            {
                break;
            }

            match events.recv_timeout(Duration::from_millis(200)) {
                Ok(event) => self.observe(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if let Some(reason) = self.failure.take() {
                bail!(reason);
            }

            if let Some(period) = write_every
                && args.rotation != RotationArg::Automatic
                && self.last_write_trigger.elapsed() >= period
            {
                writer.write_now().context("triggering file write failed")?;
                self.last_write_trigger = Instant::now();
            }

            if let Some(interval) = stats_interval
                && self.last_stats.elapsed() >= interval
            {
                self.print_stats(&args.port);
                self.last_stats = Instant::now();
            }
        }
        Ok(())
    }

    fn observe(&mut self, event: Event) {
        match event {
            Event::Samples {
                stats,
                total_samples,
                ..
            } => {
                self.total_samples = total_samples;
                self.blocks += 1;
                self.latest_stats = Some(stats);
            }
            Event::GpsFix(fix) => match fix.utc_time() {
                Some(time) => eprintln!(
                    "[GPS] {} lat {:.6} lon {:.6} alt {:.1} m",
                    time.format("%Y-%m-%d %H:%M:%S"),
                    fix.latitude,
                    fix.longitude,
                    fix.altitude
                ),
                None => eprintln!("[GPS] fix with unusable time, week {}", fix.week),
            },
            Event::Written { items, .. } => self.items_written += items as u64,
            Event::State(WorkerState::Failed) => {
                self.failure = Some("acquisition failed, see the log for the cause".to_string());
            }
            Event::Hung { thread, silent_for } => {
                self.failure = Some(format!(
                    "{thread} thread stopped responding ({silent_for:?} without heartbeat)"
                ));
            }
            Event::Finished {
                total_samples,
                blocks,
            } => {
                self.total_samples = total_samples;
                self.blocks = blocks;
            }
            Event::State(_) | Event::Status { .. } | Event::GpsUnavailable => {}
        }
    }

    fn print_stats(&self, port: &str) {
        let rate = self.total_samples as f64 / self.started.elapsed().as_secs_f64().max(0.001);
        let means = self.latest_stats.map_or_else(String::new, |stats| {
            (0..CHANNELS)
                .map(|ch| format!(" ch{ch} {:>12.1}", stats.mean[ch]))
                .collect()
        });
        eprintln!(
            "[STAT] {:>10} samples {:>8.1} S/s {:>10} written{} {}",
            self.total_samples, rate, self.items_written, means, port
        );
    }
}
