//! Energy-monitor serial protocol.
//!
//! The USB dongle streams XML-looking frames, one element per line:
//!
//! ```text
//! <InstantaneousDemand>
//!   <DeviceMacId>0xd8d5b90000001234</DeviceMacId>
//!   <TimeStamp>0x1c4b7d4e</TimeStamp>
//!   <Demand>0x00001388</Demand>
//!   <Multiplier>0x00000001</Multiplier>
//!   <Divisor>0x000003e8</Divisor>
//! </InstantaneousDemand>
//! ```
//!
//! This is not a general XML parser. It relies on the device always emitting
//! one flat root element whose closing tag is the only line starting with
//! `</` (children are indented by two spaces). If a firmware update breaks
//! that layout, frames will overflow or decode as non-matching.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use serialport::SerialPort;
use statum::{machine, state};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::SensorError;
use crate::mqtt::message::{unix_now, Reading};

/// Upper bound for one accumulated frame.
pub const MAX_FRAME_LEN: usize = 10 * 1024;

/// Seconds between the Unix epoch and the device epoch (2000-01-01).
pub const DEVICE_EPOCH_OFFSET: i64 = 946_684_806;

const FRAME_NAME: &str = "InstantaneousDemand";
const INITIALIZE_COMMAND: &str = "<Command>\r\n  <Name>initialize</Name>\r\n</Command>\r\n";
const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame exceeded the 10 KiB limit ({len} bytes buffered), discarded")]
    Overflow { len: usize },

    #[error("Frame has no {0} field")]
    MissingField(&'static str),

    #[error("Field {field} has unparseable value {value:?}")]
    BadField { field: &'static str, value: String },

    #[error("Serial read failed: {0}")]
    Io(#[from] io::Error),
}

/// One decoded demand frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DemandSample {
    pub demand: f64,
    pub device_mac_id: Option<String>,
    /// Unix seconds, if the frame carried a device timestamp.
    pub timestamp: Option<i64>,
}

impl DemandSample {
    pub fn into_reading(self, topic: &str) -> Reading {
        Reading::measurement(topic, self.timestamp.unwrap_or_else(unix_now), self.demand)
    }
}

/// Collects lines until a closing root tag completes the frame.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: String,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a line (including its terminator). Returns the finished frame
    /// when `line` closes it. On overflow the whole frame, including this
    /// line, is thrown away.
    pub fn push_line(&mut self, line: &str) -> Result<Option<String>, FrameError> {
        let len = self.buffer.len() + line.len();
        if len > MAX_FRAME_LEN {
            self.buffer.clear();
            return Err(FrameError::Overflow { len });
        }
        self.buffer.push_str(line);
        if line.starts_with("</") {
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        Ok(None)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Extracts a demand sample from a complete frame. Frames with another root
/// element yield `Ok(None)`.
pub fn decode_frame(frame: &str) -> Result<Option<DemandSample>, FrameError> {
    let tokens: Vec<&str> = frame
        .split(['<', '>', '\n'])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.first() != Some(&FRAME_NAME) {
        return Ok(None);
    }

    let mut demand = None;
    let mut device_mac_id = None;
    let mut multiplier = 1;
    let mut divisor = 1;
    let mut timestamp = None;

    let mut fields = tokens[1..].iter();
    while let Some(tag) = fields.next() {
        match *tag {
            "Demand" => {
                let raw = parse_hex("Demand", field_value(&mut fields, "Demand")?)?;
                demand = Some(signed_demand(raw));
            }
            "DeviceMacId" => {
                device_mac_id = Some(field_value(&mut fields, "DeviceMacId")?.to_string());
            }
            "Multiplier" => {
                multiplier = parse_hex("Multiplier", field_value(&mut fields, "Multiplier")?)?.max(1);
            }
            "Divisor" => {
                divisor = parse_hex("Divisor", field_value(&mut fields, "Divisor")?)?.max(1);
            }
            "TimeStamp" => {
                let raw = parse_hex("TimeStamp", field_value(&mut fields, "TimeStamp")?)?;
                timestamp = Some(i64::from(raw) + DEVICE_EPOCH_OFFSET);
            }
            _ => {}
        }
    }

    let demand = demand.ok_or(FrameError::MissingField("Demand"))?;
    Ok(Some(DemandSample {
        demand: demand as f64 * f64::from(multiplier) / f64::from(divisor),
        device_mac_id,
        timestamp,
    }))
}

fn field_value<'a, 'b: 'a>(
    fields: &mut impl Iterator<Item = &'a &'b str>,
    field: &'static str,
) -> Result<&'b str, FrameError> {
    match fields.next() {
        Some(value) if !value.starts_with('/') => Ok(*value),
        _ => Err(FrameError::MissingField(field)),
    }
}

fn parse_hex(field: &'static str, value: &str) -> Result<u32, FrameError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).map_err(|_| FrameError::BadField {
        field,
        value: value.to_string(),
    })
}

/// Demand is a 24-bit two's complement quantity; values that use the full
/// 32 bits are taken as already sign-extended.
fn signed_demand(raw: u32) -> i64 {
    if raw >= 1 << 24 {
        i64::from(raw as i32)
    } else if raw >= 1 << 23 {
        i64::from(raw) - (1 << 24)
    } else {
        i64::from(raw)
    }
}

/// Yields demand samples from a line-oriented byte stream. Read timeouts are
/// treated as "no data yet"; bytes of an unfinished line are kept, but never
/// more than [`MAX_FRAME_LEN`] including the frame collected so far.
pub struct FrameReader<R> {
    reader: R,
    assembler: FrameAssembler,
    line: Vec<u8>,
    // Set after an overflow inside a line; cleared at the next newline.
    discarding: bool,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            assembler: FrameAssembler::new(),
            line: Vec::new(),
            discarding: false,
        }
    }
}

impl<R: BufRead> Iterator for FrameReader<R> {
    type Item = Result<DemandSample, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let held = self.assembler.buffered() + self.line.len();
            let room = (MAX_FRAME_LEN + 1).saturating_sub(held).max(1) as u64;
            match (&mut self.reader)
                .take(room)
                .read_until(b'\n', &mut self.line)
            {
                Ok(0) => return None,
                Ok(_) => {
                    if self.line.last() != Some(&b'\n') {
                        if self.discarding {
                            self.line.clear();
                            continue;
                        }
                        let len = self.assembler.buffered() + self.line.len();
                        if len > MAX_FRAME_LEN {
                            self.line.clear();
                            self.assembler.clear();
                            self.discarding = true;
                            return Some(Err(FrameError::Overflow { len }));
                        }
                        continue;
                    }
                    if self.discarding {
                        self.line.clear();
                        self.discarding = false;
                        continue;
                    }
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();

                    match self.assembler.push_line(&line) {
                        Ok(None) => continue,
                        Err(e) => return Some(Err(e)),
                        Ok(Some(frame)) => match decode_frame(&frame) {
                            Ok(Some(sample)) => return Some(Ok(sample)),
                            Ok(None) => {
                                debug!("Skipping non-demand frame ({} bytes)", frame.len());
                                continue;
                            }
                            Err(e) => return Some(Err(e)),
                        },
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Some(Err(FrameError::Io(e))),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub device: String,
    pub baud_rate: u32,
}

#[state]
#[derive(Debug, Clone)]
pub enum PortState {
    Closed,
    Streaming,
}

// Box<dyn SerialPort> is not Debug, so neither is the machine.
#[machine]
pub struct EnergyMonitor<S: PortState> {
    settings: SerialSettings,
    frames: Option<FrameReader<BufReader<Box<dyn SerialPort>>>>,
}

impl EnergyMonitor<Closed> {
    pub fn create(settings: SerialSettings) -> Self {
        Self::new(settings, None)
    }

    /// Opens the port and asks the device to start streaming.
    pub fn open(mut self) -> Result<EnergyMonitor<Streaming>, SensorError> {
        info!(
            "Opening energy monitor on {} at {} baud",
            self.settings.device, self.settings.baud_rate
        );
        let mut port = serialport::new(&self.settings.device, self.settings.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| SensorError::Device {
                device: self.settings.device.clone(),
                reason: e.to_string(),
            })?;
        port.write_all(INITIALIZE_COMMAND.as_bytes())?;
        port.flush()?;

        self.frames = Some(FrameReader::new(BufReader::new(port)));
        Ok(self.transition())
    }
}

impl EnergyMonitor<Streaming> {
    /// Forwards samples until the device fails. Returns `false` once nobody
    /// is listening anymore.
    pub fn forward(&mut self, samples: &Sender<DemandSample>) -> bool {
        let Some(frames) = self.frames.as_mut() else {
            return true;
        };
        for item in frames {
            match item {
                Ok(mut sample) => {
                    sample.timestamp.get_or_insert_with(unix_now);
                    debug!(
                        "Demand {} from {}",
                        sample.demand,
                        sample.device_mac_id.as_deref().unwrap_or("unknown device")
                    );
                    if samples.send(sample).is_err() {
                        return false;
                    }
                }
                Err(FrameError::Io(e)) => {
                    warn!("Energy monitor {} failed: {}", self.settings.device, e);
                    return true;
                }
                Err(e) => warn!("Dropping frame: {}", e),
            }
        }
        warn!("Energy monitor {} closed the stream", self.settings.device);
        true
    }

    pub fn close(self) -> EnergyMonitor<Closed> {
        info!("Closing energy monitor on {}", self.settings.device);
        let mut closed: EnergyMonitor<Closed> = self.transition();
        closed.frames = None;
        closed
    }
}

/// Runs the blocking serial reader on its own thread so a stalled device
/// only stalls this source. Decoded samples are picked up by
/// [`drain`](Self::drain) on the scheduler's tick.
pub struct EnergyMonitorSource {
    samples: Receiver<DemandSample>,
    _reader: JoinHandle<()>,
}

impl EnergyMonitorSource {
    pub fn spawn(settings: SerialSettings, reopen_backoff: Duration) -> Result<Self, SensorError> {
        let (tx, rx) = mpsc::channel();
        let name = format!("energy-monitor:{}", settings.device);
        let reader = std::thread::Builder::new()
            .name(name)
            .spawn(move || stream(settings, tx, reopen_backoff))?;
        Ok(Self {
            samples: rx,
            _reader: reader,
        })
    }

    /// Every sample decoded since the last call, oldest first.
    pub fn drain(&self, topic: &str) -> Result<Vec<Reading>, SensorError> {
        let mut readings = Vec::new();
        loop {
            match self.samples.try_recv() {
                Ok(sample) => readings.push(sample.into_reading(topic)),
                Err(TryRecvError::Empty) => return Ok(readings),
                Err(TryRecvError::Disconnected) if readings.is_empty() => {
                    return Err(SensorError::Unavailable(
                        "energy monitor reader stopped".into(),
                    ))
                }
                Err(TryRecvError::Disconnected) => return Ok(readings),
            }
        }
    }
}

fn stream(settings: SerialSettings, samples: Sender<DemandSample>, reopen_backoff: Duration) {
    loop {
        match EnergyMonitor::create(settings.clone()).open() {
            Ok(mut monitor) => {
                let listening = monitor.forward(&samples);
                monitor.close();
                if !listening {
                    info!("Energy monitor reader on {} finished", settings.device);
                    return;
                }
            }
            Err(e) => error!("{}", e),
        }
        std::thread::sleep(reopen_backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(demand: &str, multiplier: &str, divisor: &str) -> String {
        format!(
            "<InstantaneousDemand>\r\n  <DeviceMacId>0xd8d5b90000001234</DeviceMacId>\r\n  \
             <MeterMacId>0x00135003007c1f2a</MeterMacId>\r\n  <TimeStamp>0x1c4b7d4e</TimeStamp>\r\n  \
             <Demand>{}</Demand>\r\n  <Multiplier>{}</Multiplier>\r\n  <Divisor>{}</Divisor>\r\n  \
             <DigitsRight>0x03</DigitsRight>\r\n</InstantaneousDemand>\r\n",
            demand, multiplier, divisor
        )
    }

    #[test]
    fn decodes_demand_with_unit_scaling() {
        let sample = decode_frame(&frame("0x00001388", "0x00000001", "0x00000001"))
            .unwrap()
            .unwrap();
        assert_eq!(sample.demand, 5000.0);
        assert_eq!(sample.device_mac_id.as_deref(), Some("0xd8d5b90000001234"));
        assert_eq!(sample.timestamp, Some(0x1c4b7d4e + DEVICE_EPOCH_OFFSET));
    }

    #[test]
    fn zero_divisor_and_multiplier_count_as_one() {
        let sample = decode_frame(&frame("0x00001388", "0x00000000", "0x00000000"))
            .unwrap()
            .unwrap();
        assert_eq!(sample.demand, 5000.0);
    }

    #[test]
    fn scales_by_multiplier_over_divisor() {
        let sample = decode_frame(&frame("0x000004d2", "0x00000001", "0x000003e8"))
            .unwrap()
            .unwrap();
        assert!((sample.demand - 1.234).abs() < 1e-9);
    }

    #[test]
    fn negative_24_bit_demand_is_sign_extended() {
        let sample = decode_frame(&frame("0x00fffc18", "0x00000001", "0x00000001"))
            .unwrap()
            .unwrap();
        assert_eq!(sample.demand, -1000.0);
        assert_eq!(signed_demand(0x007f_ffff), 0x7f_ffff);
        assert_eq!(signed_demand(0xffff_ffff), -1);
    }

    #[test]
    fn other_root_elements_are_skipped() {
        let other = "<ConnectionStatus>\n  <Status>Connected</Status>\n</ConnectionStatus>\n";
        assert!(decode_frame(other).unwrap().is_none());
    }

    #[test]
    fn unparseable_demand_aborts_only_that_frame() {
        let err = decode_frame(&frame("0xZZZZ", "0x1", "0x1")).unwrap_err();
        assert!(matches!(err, FrameError::BadField { field: "Demand", .. }));
    }

    #[test]
    fn missing_demand_is_reported() {
        let partial = "<InstantaneousDemand>\n  <Divisor>0x1</Divisor>\n</InstantaneousDemand>\n";
        assert!(matches!(
            decode_frame(partial),
            Err(FrameError::MissingField("Demand"))
        ));
    }

    #[test]
    fn overflow_discards_frame_and_starts_clean() {
        let mut assembler = FrameAssembler::new();
        assembler.push_line("<InstantaneousDemand>\n").unwrap();
        let filler = format!("  <Junk>{}</Junk>\n", "x".repeat(1000));
        let mut overflowed = false;
        for _ in 0..20 {
            if let Err(FrameError::Overflow { len }) = assembler.push_line(&filler) {
                assert!(len > MAX_FRAME_LEN);
                overflowed = true;
                break;
            }
        }
        assert!(overflowed);
        assert_eq!(assembler.buffered(), 0);

        let mut completed = None;
        for line in frame("0x00001388", "0x1", "0x1").split_inclusive('\n') {
            if let Some(done) = assembler.push_line(line).unwrap() {
                completed = Some(done);
            }
        }
        let sample = decode_frame(&completed.unwrap()).unwrap().unwrap();
        assert_eq!(sample.demand, 5000.0);
    }

    #[test]
    fn reader_yields_samples_across_noise_and_overflow() {
        let mut stream = String::new();
        stream.push_str("<ConnectionStatus>\n  <Status>Joined</Status>\n</ConnectionStatus>\n");
        stream.push_str(&frame("0x00000064", "0x1", "0x1"));
        stream.push_str("<InstantaneousDemand>\n");
        for _ in 0..11 {
            stream.push_str(&format!("  <Pad>{}</Pad>\n", "y".repeat(1000)));
        }
        stream.push_str(&frame("0x000000c8", "0x1", "0x1"));

        let reader = FrameReader::new(Cursor::new(stream.into_bytes()));
        let results: Vec<_> = reader.collect();

        let demands: Vec<f64> = results
            .iter()
            .filter_map(|r| r.as_ref().ok().map(|s| s.demand))
            .collect();
        assert_eq!(demands, vec![100.0, 200.0]);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(FrameError::Overflow { .. }))));
    }

    #[test]
    fn endless_line_is_capped_and_skipped() {
        let mut stream = "z".repeat(1024 * 1024).into_bytes();
        stream.push(b'\n');
        stream.extend_from_slice(frame("0x00000064", "0x1", "0x1").as_bytes());
        let mut reader = FrameReader::new(Cursor::new(stream));

        match reader.next() {
            Some(Err(FrameError::Overflow { len })) => assert!(len > MAX_FRAME_LEN),
            other => panic!("expected overflow, got {:?}", other),
        }
        assert!(reader.line.len() + reader.assembler.buffered() <= MAX_FRAME_LEN);

        let sample = reader.next().unwrap().unwrap();
        assert_eq!(sample.demand, 100.0);
        assert!(reader.line.capacity() <= 2 * (MAX_FRAME_LEN + 1));
        assert!(reader.next().is_none());
    }

    #[test]
    fn sample_without_device_time_uses_host_clock() {
        let sample = DemandSample {
            demand: 1.5,
            device_mac_id: None,
            timestamp: None,
        };
        let before = unix_now();
        let reading = sample.into_reading("raven/house/demand");
        assert!(reading.timestamp() >= before);
        assert_eq!(reading.topic(), "raven/house/demand");
    }
}
