use super::block::{CHANNELS, Sample, SampleBlock};
use super::config::{DEFAULT_FILTER_FREQUENCY, FrequencyLimits, ProtocolConfig};
use super::gps::{GpsDecoder, GpsFix};
use super::Link;
use crate::error::{Error, Result};
use crate::events::StatusSink;
use chrono::{TimeDelta, Utc};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

const CHECK_ADC: u8 = 0x03;
const CHECK_GPS: u8 = 0x04;
const START_RECEIVE_50: u8 = 0x01;
const START_RECEIVE_200: u8 = 0x02;
const STOP_RECEIVE: u8 = 0x00;
const ADC_READY: u8 = CHECK_ADC;

const DATA_PREFIX: [u8; 5] = [0xF0; 5];
const POINTS_IN_PACKET: usize = 200;
const FRAME_LEN: usize = CHANNELS * POINTS_IN_PACKET * size_of::<i32>();
const FRAME_PERIOD_NANOS: i64 = 1_000_000_000;
const READ_CHUNK: usize = 4 * 1024;

pub const SERIAL_LIMITS: FrequencyLimits = FrequencyLimits {
    min: 1,
    base: POINTS_IN_PACKET as u32,
};

pub struct SerialProtocol {
    config: ProtocolConfig,
    link: Option<Box<dyn Link>>,
    sink: StatusSink,
    adc_ready: bool,
    receiving: bool,
    frames: AdcFramer,
    gps: GpsDecoder,
    pending_fix: Option<GpsFix>,
}

impl SerialProtocol {
    pub fn open(config: ProtocolConfig, sink: StatusSink) -> Result<Self> {
        SERIAL_LIMITS.validate(config.sampling_frequency)?;
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(config.data_bits)
            .stop_bits(config.stop_bits)
            .parity(config.parity)
            .flow_control(config.flow_control)
            .timeout(config.read_timeout)
            .open()
            .map_err(|err| {
                Error::Transport(format!(
                    "opening serial port {} @ {} failed: {err}",
                    config.port, config.baud_rate
                ))
            })?;
        Self::from_link(config, Box::new(port), sink)
    }

    pub fn from_link(config: ProtocolConfig, link: Box<dyn Link>, sink: StatusSink) -> Result<Self> {
        SERIAL_LIMITS.validate(config.sampling_frequency)?;
        Ok(Self {
            config,
            link: Some(link),
            sink,
            adc_ready: false,
            receiving: false,
            frames: AdcFramer::default(),
            gps: GpsDecoder::new(),
            pending_fix: None,
        })
    }

    pub fn description(&self) -> String {
        format!("Serial port {}", self.config.port)
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    // Ask the ADC whether it is ready; does not start sampling.
    pub fn check_ready(&mut self) -> Result<()> {
        if self.receiving {
            return Err(Error::State("cannot check ADC while receiving".to_string()));
        }
        self.send(CHECK_ADC)?;
        let deadline = Instant::now() + self.config.check_timeout;
        while Instant::now() < deadline {
            let chunk = self.read_chunk()?;
            if chunk.contains(&ADC_READY) {
                self.adc_ready = true;
                return Ok(());
            }
        }
        Err(Error::Transport(format!(
            "ADC on {} did not answer within {:?}",
            self.config.port, self.config.check_timeout
        )))
    }

    // Ask the GPS receiver for a packet and wait until one decodes.
    pub fn check_gps(&mut self) -> Result<()> {
        self.send(CHECK_GPS)?;
        let deadline = Instant::now() + self.config.check_timeout;
        while Instant::now() < deadline {
            let chunk = self.read_chunk()?;
            self.gps.push(&chunk);
            while let Some(packet) = self.gps.next_packet() {
                match packet {
                    Ok(fix) => {
                        self.pending_fix = Some(fix);
                        return Ok(());
                    }
                    Err(err) => self.sink.warning(format!("{err}, packet discarded")),
                }
            }
        }
        Err(Error::Transport(format!(
            "GPS on {} sent no valid packet within {:?}",
            self.config.port, self.config.check_timeout
        )))
    }

    pub fn start_receiving(&mut self) -> Result<()> {
        if !self.adc_ready {
            return Err(Error::State("ADC not ready".to_string()));
        }
        if self.receiving {
            return Err(Error::State("already receiving".to_string()));
        }
        let command = if self.config.filter_frequency == DEFAULT_FILTER_FREQUENCY {
            START_RECEIVE_200
        } else {
            START_RECEIVE_50
        };
        // Frames still buffered from before a pause would get fresh timestamps.
        self.link_mut()?.discard_input()?;
        self.frames = AdcFramer::default();
        self.send(command)?;
        self.receiving = true;
        Ok(())
    }

    pub fn stop_receiving(&mut self) -> Result<()> {
        if !self.receiving {
            return Ok(());
        }
        self.receiving = false;
        self.send(STOP_RECEIVE)
    }

    pub fn read(&mut self) -> Result<Option<SampleBlock>> {
        if !self.receiving {
            return Err(Error::State("read called while not receiving".to_string()));
        }
        if let Some(frame) = self.frames.next_frame() {
            return self.decode_frame(&frame).map(Some);
        }
        let chunk = self.read_chunk()?;
        self.frames.push(&chunk);
        match self.frames.next_frame() {
            Some(frame) => self.decode_frame(&frame).map(Some),
            None => Ok(None),
        }
    }

    // Latest valid fix decoded from bytes available now. Corrupted packets are
    // reported and skipped.
    pub fn read_gps_fix(&mut self) -> Option<GpsFix> {
        let mut latest = self.pending_fix.take();
        if self.link.is_none() {
            return latest;
        }
        match self.read_chunk() {
            Ok(chunk) => self.gps.push(&chunk),
            Err(err) => {
                self.sink.report(&err);
                return latest;
            }
        }
        while let Some(packet) = self.gps.next_packet() {
            match packet {
                Ok(fix) => latest = Some(fix),
                Err(err) => self.sink.warning(format!("{err}, packet discarded")),
            }
        }
        latest
    }

    // Apply new link and sampling settings. Rejected while receiving.
    pub fn set_parameters(&mut self, config: ProtocolConfig) -> Result<()> {
        if self.receiving {
            return Err(Error::State(
                "parameters cannot change while receiving".to_string(),
            ));
        }
        SERIAL_LIMITS.validate(config.sampling_frequency)?;
        if let Some(link) = self.link.as_mut() {
            link.configure(&config)?;
        }
        self.config = config;
        Ok(())
    }

    pub fn close(&mut self) {
        if self.link.is_none() {
            return;
        }
        if let Err(err) = self.stop_receiving() {
            self.sink.report(&err);
        }
        self.link = None;
        self.adc_ready = false;
        self.receiving = false;
    }

    fn send(&mut self, command: u8) -> Result<()> {
        let port = self.config.port.clone();
        let link = self.link_mut()?;
        link.write_all(&[command])
            .and_then(|()| link.flush())
            .map_err(|err| Error::Transport(format!("writing command {command:#04x} to {port} failed: {err}")))
    }

    fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let port = self.config.port.clone();
        let link = self.link_mut()?;
        let mut buffer = vec![0_u8; READ_CHUNK];
        let size = match link.read(&mut buffer) {
            Ok(size) => size,
            Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => 0,
            Err(err) => {
                return Err(Error::Transport(format!("reading from {port} failed: {err}")));
            }
        };
        buffer.truncate(size);
        if self.config.trace_raw && !buffer.is_empty() {
            self.sink.trace(format!("{port}: {}", hex(&buffer)));
        }
        Ok(buffer)
    }

    fn link_mut(&mut self) -> Result<&mut Box<dyn Link>> {
        self.link
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("{} is closed", self.config.port)))
    }

    // Average every `200 / f` points into one sample; timestamps cover the
    // second that ends now.
    fn decode_frame(&self, frame: &[u8]) -> Result<SampleBlock> {
        let frequency = self.config.sampling_frequency as usize;
        let avg_size = POINTS_IN_PACKET / frequency;
        let points: Vec<[i32; CHANNELS]> = frame
            .chunks_exact(CHANNELS * size_of::<i32>())
            .map(|point| {
                let mut channels = [0_i32; CHANNELS];
                for (ch, raw) in point.chunks_exact(size_of::<i32>()).enumerate() {
                    channels[ch] = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                }
                channels
            })
            .collect();

        let samples: Vec<Sample> = points
            .chunks_exact(avg_size)
            .map(|group| {
                let mut sums = [0_i64; CHANNELS];
                for point in group {
                    for ch in 0..CHANNELS {
                        sums[ch] += i64::from(point[ch]);
                    }
                }
                Sample::new(sums.map(|sum| (sum / avg_size as i64) as i32))
            })
            .collect();

        let start = Utc::now() - TimeDelta::nanoseconds(FRAME_PERIOD_NANOS);
        let step = FRAME_PERIOD_NANOS / samples.len().max(1) as i64;
        let timestamps = (0..samples.len())
            .map(|i| start + TimeDelta::nanoseconds(step * i as i64))
            .collect();
        SampleBlock::new(timestamps, samples)
    }
}

impl Drop for SerialProtocol {
    fn drop(&mut self) {
        self.close();
    }
}

// Splits the ADC byte stream into frames, resynchronising on the prefix.
#[derive(Debug, Default)]
struct AdcFramer {
    buffer: Vec<u8>,
    synced: bool,
}

impl AdcFramer {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        if !self.synced {
            let found = self
                .buffer
                .windows(DATA_PREFIX.len())
                .position(|window| window == DATA_PREFIX);
            let Some(start) = found else {
                let keep = (DATA_PREFIX.len() - 1).min(self.buffer.len());
                self.buffer.drain(..self.buffer.len() - keep);
                return None;
            };
            self.buffer.drain(..start + DATA_PREFIX.len());
            self.synced = true;
        }
        if self.buffer.len() < FRAME_LEN {
            return None;
        }
        self.synced = false;
        Some(self.buffer.drain(..FRAME_LEN).collect())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::{Event, Level};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    // In-memory link: each `read` returns the next scripted chunk, or times out.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedLink {
        pub rx: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pub tx: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedLink {
        pub fn with_chunks(chunks: Vec<Vec<u8>>) -> Self {
            let link = Self::default();
            link.rx.lock().unwrap().extend(chunks);
            link
        }

        pub fn written(&self) -> Vec<u8> {
            self.tx.lock().unwrap().clone()
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(chunk) = self.rx.lock().unwrap().pop_front() else {
                std::thread::sleep(Duration::from_millis(1));
                return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
            };
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    impl Write for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Link for ScriptedLink {
        fn discard_input(&mut self) -> Result<()> {
            self.rx.lock().unwrap().clear();
            Ok(())
        }
    }

    fn config(frequency: u32) -> ProtocolConfig {
        ProtocolConfig {
            port: "/dev/ttyFAKE".into(),
            sampling_frequency: frequency,
            check_timeout: Duration::from_millis(50),
            ..ProtocolConfig::default()
        }
    }

    fn frame(value_of: impl Fn(usize, usize) -> i32) -> Vec<u8> {
        let mut bytes = DATA_PREFIX.to_vec();
        for point in 0..POINTS_IN_PACKET {
            for ch in 0..CHANNELS {
                bytes.extend_from_slice(&value_of(point, ch).to_le_bytes());
            }
        }
        bytes
    }

    fn ready_protocol(frequency: u32, link: ScriptedLink) -> SerialProtocol {
        link.rx.lock().unwrap().push_front(vec![ADC_READY]);
        let mut protocol =
            SerialProtocol::from_link(config(frequency), Box::new(link), StatusSink::detached()).unwrap();
        protocol.check_ready().unwrap();
        protocol
    }

    #[test]
    fn rejects_frequencies_that_do_not_divide_the_packet() {
        for f in [0, 3, 7, 400] {
            let result = SerialProtocol::from_link(
                config(f),
                Box::new(ScriptedLink::default()),
                StatusSink::detached(),
            );
            assert!(matches!(result, Err(Error::Config(_))), "{f} Hz accepted");
        }
        for f in [1, 50, 100, 200] {
            let result = SerialProtocol::from_link(
                config(f),
                Box::new(ScriptedLink::default()),
                StatusSink::detached(),
            );
            assert!(result.is_ok(), "{f} Hz rejected");
        }
    }

    #[test]
    fn missing_device_is_a_transport_error() {
        let config = ProtocolConfig {
            port: "/dev/seismoreg-no-such-port".into(),
            ..ProtocolConfig::default()
        };
        let result = SerialProtocol::open(config, StatusSink::detached());
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[test]
    fn check_ready_sends_command_and_waits_for_answer() {
        let link = ScriptedLink::with_chunks(vec![vec![ADC_READY]]);
        let mut protocol =
            SerialProtocol::from_link(config(200), Box::new(link.clone()), StatusSink::detached())
                .unwrap();
        protocol.check_ready().unwrap();
        assert_eq!(link.written(), vec![CHECK_ADC]);
    }

    #[test]
    fn silent_adc_fails_the_check() {
        let mut protocol = SerialProtocol::from_link(
            config(200),
            Box::new(ScriptedLink::default()),
            StatusSink::detached(),
        )
        .unwrap();
        assert!(matches!(protocol.check_ready(), Err(Error::Transport(_))));
        assert!(matches!(protocol.start_receiving(), Err(Error::State(_))));
    }

    #[test]
    fn full_rate_frame_is_copied_point_by_point() {
        let link = ScriptedLink::default();
        let mut protocol = ready_protocol(200, link.clone());
        protocol.start_receiving().unwrap();
        assert_eq!(link.written(), vec![CHECK_ADC, START_RECEIVE_200]);

        let bytes = frame(|point, ch| (point * 10 + ch) as i32);
        // Deliver in two chunks with leading noise.
        let mut first = vec![0x11, 0x22];
        first.extend_from_slice(&bytes[..100]);
        link.rx.lock().unwrap().extend([first, bytes[100..].to_vec()]);

        assert!(protocol.read().unwrap().is_none());
        let block = protocol.read().unwrap().unwrap();
        assert_eq!(block.len(), 200);
        assert_eq!(block.samples()[0], Sample::new([0, 1, 2]));
        assert_eq!(block.samples()[199], Sample::new([1990, 1991, 1992]));
        assert!(block.timestamps().windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn reduced_rate_averages_consecutive_points() {
        let link = ScriptedLink::default();
        let mut protocol = ready_protocol(50, link.clone());
        protocol.start_receiving().unwrap();
        link.rx.lock().unwrap().push_back(frame(|point, ch| (point as i32) * (ch as i32 + 1)));

        let block = protocol.read().unwrap().unwrap();
        assert_eq!(block.len(), 50);
        // Points 0..4 average to 1.5, truncated to 1.
        assert_eq!(block.samples()[0], Sample::new([1, 3, 4]));
        assert_eq!(block.samples()[49], Sample::new([197, 395, 592]));
    }

    #[test]
    fn filter_frequency_selects_start_command() {
        let link = ScriptedLink::with_chunks(vec![vec![ADC_READY]]);
        let mut protocol = SerialProtocol::from_link(
            ProtocolConfig {
                filter_frequency: 50,
                ..config(200)
            },
            Box::new(link.clone()),
            StatusSink::detached(),
        )
        .unwrap();
        protocol.check_ready().unwrap();
        protocol.start_receiving().unwrap();
        protocol.stop_receiving().unwrap();
        assert_eq!(link.written(), vec![CHECK_ADC, START_RECEIVE_50, STOP_RECEIVE]);
    }

    #[test]
    fn restart_drops_frames_buffered_while_stopped() {
        let link = ScriptedLink::default();
        let mut protocol = ready_protocol(200, link.clone());
        protocol.start_receiving().unwrap();
        protocol.stop_receiving().unwrap();
        link.rx.lock().unwrap().push_back(frame(|_, _| 7));

        protocol.start_receiving().unwrap();
        assert!(protocol.read().unwrap().is_none());
        link.rx.lock().unwrap().push_back(frame(|_, _| 9));
        let block = protocol.read().unwrap().unwrap();
        assert_eq!(block.samples()[0], Sample::new([9, 9, 9]));
        assert_eq!(
            link.written(),
            vec![CHECK_ADC, START_RECEIVE_200, STOP_RECEIVE, START_RECEIVE_200]
        );
    }

    #[test]
    fn parameters_are_immutable_while_receiving() {
        let mut protocol = ready_protocol(200, ScriptedLink::default());
        protocol.start_receiving().unwrap();
        assert!(matches!(
            protocol.set_parameters(config(100)),
            Err(Error::State(_))
        ));
        protocol.stop_receiving().unwrap();
        protocol.set_parameters(config(100)).unwrap();
        assert_eq!(protocol.config().sampling_frequency, 100);
        assert!(matches!(
            protocol.set_parameters(config(7)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let link = ScriptedLink::default();
        let mut protocol = ready_protocol(200, link.clone());
        protocol.start_receiving().unwrap();
        protocol.close();
        protocol.close();
        assert!(!protocol.is_open());
        assert_eq!(link.written().last(), Some(&STOP_RECEIVE));
        assert!(matches!(protocol.read(), Err(Error::State(_))));
    }

    #[test]
    fn corrupted_gps_packet_yields_no_fix_and_later_packets_recover() {
        let fix = |tow| GpsFix {
            time_of_week: tow,
            week: 2304,
            utc_offset: 18,
            latitude: 45.0333,
            longitude: 38.9833,
            altitude: 27.5,
        };
        let mut corrupted = fix(11).to_packet();
        let last = corrupted.len() - 1;
        corrupted[last] = 0xFF;

        let link = ScriptedLink::with_chunks(vec![
            fix(10).to_packet(),
            corrupted,
            fix(12).to_packet(),
            fix(13).to_packet(),
        ]);
        let (sink, events) = StatusSink::channel();
        let mut protocol = SerialProtocol::from_link(config(200), Box::new(link), sink).unwrap();

        assert_eq!(protocol.read_gps_fix(), Some(fix(10)));
        assert_eq!(protocol.read_gps_fix(), None);
        assert_eq!(protocol.read_gps_fix(), Some(fix(12)));
        assert_eq!(protocol.read_gps_fix(), Some(fix(13)));

        let reported = events.try_iter().any(|event| {
            matches!(
                event,
                Event::Status { level: Level::Warning, ref message } if message.contains("corrupted packet")
            )
        });
        assert!(reported, "corrupted packet was not reported");
    }

    #[test]
    fn gps_check_keeps_the_first_fix() {
        let fix = GpsFix {
            time_of_week: 500,
            week: 2300,
            utc_offset: 18,
            latitude: -12.5,
            longitude: 130.8,
            altitude: 40.0,
        };
        let link = ScriptedLink::with_chunks(vec![vec![0x00], fix.to_packet()]);
        let mut protocol =
            SerialProtocol::from_link(config(200), Box::new(link.clone()), StatusSink::detached())
                .unwrap();
        protocol.check_gps().unwrap();
        assert_eq!(link.written(), vec![CHECK_GPS]);
        assert_eq!(protocol.read_gps_fix(), Some(fix));
        assert_eq!(protocol.read_gps_fix(), None);
    }
}
