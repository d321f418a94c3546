//! Bulk sender with throughput statistics.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ch34x_uart::{Ch34xDriver, UsbTransport};
use futures::executor::block_on;
use log::debug;

/// Parse a hex string such as "01 02 03 aa" or "010203aa".
pub fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();

    if digits.is_empty() {
        return Err("payload is empty".to_string());
    }
    if !digits.is_ascii() {
        return Err(format!("non-hex characters in '{}'", text));
    }
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{}'", text));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| format!("invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

/// Parse a single byte given as hex, with or without a 0x prefix.
pub fn parse_byte(text: &str) -> Result<u8, String> {
    u8::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|e| format!("invalid byte '{}': {}", text, e))
}

/// Running byte counts, sampled once per second.
pub struct ThroughputMeter {
    started: Instant,
    last_tick: Instant,
    bytes_at_tick: u64,
    total_bytes: u64,
    packets: u64,
    last_rate: Option<f64>,
}

/// Totals for a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub packets: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub bytes_per_sec: f64,
    /// Rate of the most recent sample that moved any data
    pub last_second_bytes_per_sec: Option<f64>,
}

/// One per-second sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub packets: u64,
    pub total_bytes: u64,
    pub bytes_per_sec: f64,
}

impl ThroughputMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            last_tick: now,
            bytes_at_tick: 0,
            total_bytes: 0,
            packets: 0,
            last_rate: None,
        }
    }

    /// Count one successfully sent packet.
    pub fn record(&mut self, bytes: usize) {
        self.packets += 1;
        self.total_bytes += bytes as u64;
    }

    /// Returns a sample once at least a second has passed since the last one.
    pub fn tick(&mut self, now: Instant) -> Option<Sample> {
        let elapsed = now.duration_since(self.last_tick);
        if elapsed < Duration::from_secs(1) {
            return None;
        }

        let sent = self.total_bytes - self.bytes_at_tick;
        self.last_tick = now;
        self.bytes_at_tick = self.total_bytes;

        let bytes_per_sec = sent as f64 / elapsed.as_secs_f64();
        if sent > 0 {
            self.last_rate = Some(bytes_per_sec);
        }

        Some(Sample {
            packets: self.packets,
            total_bytes: self.total_bytes,
            bytes_per_sec,
        })
    }

    pub fn summary(&self, now: Instant) -> Summary {
        let elapsed = now.duration_since(self.started);
        let secs = elapsed.as_secs_f64();
        Summary {
            packets: self.packets,
            total_bytes: self.total_bytes,
            elapsed,
            bytes_per_sec: if secs > 0.0 {
                self.total_bytes as f64 / secs
            } else {
                0.0
            },
            last_second_bytes_per_sec: self.last_rate,
        }
    }
}

/// Send `payload` `packets` times, reporting progress through `on_sample`.
///
/// A failed or short transfer ends the run.
pub fn send<T, F>(
    driver: &mut Ch34xDriver<T>,
    payload: &[u8],
    packets: u64,
    mut on_sample: F,
) -> Result<Summary>
where
    T: UsbTransport,
    F: FnMut(&Sample),
{
    let mut meter = ThroughputMeter::new(Instant::now());

    for packet in 0..packets {
        let sent = block_on(driver.write(payload))
            .with_context(|| format!("Bulk transfer failed on packet {}", packet + 1))?;
        if sent != payload.len() {
            anyhow::bail!(
                "Short bulk transfer on packet {}: {} of {} bytes",
                packet + 1,
                sent,
                payload.len()
            );
        }
        meter.record(sent);

        if let Some(sample) = meter.tick(Instant::now()) {
            on_sample(&sample);
        }
    }

    let summary = meter.summary(Instant::now());
    debug!("send finished: {:?}", summary);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ch34x_uart::{ControlRequest, TransportError};

    /// Accepts control transfers and counts bulk bytes, failing on request.
    struct CountingTransport {
        bulk_bytes: usize,
        bulk_calls: usize,
        fail_on_call: Option<usize>,
        short_by: usize,
    }

    impl CountingTransport {
        fn new() -> Self {
            Self {
                bulk_bytes: 0,
                bulk_calls: 0,
                fail_on_call: None,
                short_by: 0,
            }
        }
    }

    impl UsbTransport for CountingTransport {
        async fn control_out(
            &mut self,
            _setup: ControlRequest,
            data: &[u8],
        ) -> Result<usize, TransportError> {
            Ok(data.len())
        }

        async fn control_in(
            &mut self,
            _setup: ControlRequest,
            buf: &mut [u8],
        ) -> Result<usize, TransportError> {
            Ok(buf.len())
        }

        async fn bulk_out(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            self.bulk_calls += 1;
            if self.fail_on_call == Some(self.bulk_calls) {
                return Err(TransportError::Timeout);
            }
            let sent = data.len() - self.short_by;
            self.bulk_bytes += sent;
            Ok(sent)
        }

        async fn release(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn test_send_counts_every_packet() {
        let mut driver = Ch34xDriver::new(CountingTransport::new());
        let summary = send(&mut driver, &[0xAA; 64], 10, |_| {}).unwrap();

        assert_eq!(summary.packets, 10);
        assert_eq!(summary.total_bytes, 640);
        assert_eq!(driver.transport().bulk_bytes, 640);
    }

    #[test]
    fn test_send_stops_on_first_failure() {
        let mut transport = CountingTransport::new();
        transport.fail_on_call = Some(3);
        let mut driver = Ch34xDriver::new(transport);

        let error = send(&mut driver, &[0x01, 0x02], 10, |_| {}).unwrap_err();
        assert!(error.to_string().contains("packet 3"));
        assert_eq!(driver.transport().bulk_calls, 3);
    }

    #[test]
    fn test_send_rejects_short_transfer() {
        let mut transport = CountingTransport::new();
        transport.short_by = 1;
        let mut driver = Ch34xDriver::new(transport);

        let error = send(&mut driver, &[0x01, 0x02], 5, |_| {}).unwrap_err();
        assert!(error.to_string().contains("Short bulk transfer"));
        assert_eq!(driver.transport().bulk_calls, 1);
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("01 02 03 aa").unwrap(), vec![0x01, 0x02, 0x03, 0xAA]);
        assert_eq!(parse_hex("0102,03AA").unwrap(), vec![0x01, 0x02, 0x03, 0xAA]);
        assert!(parse_hex("").is_err());
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_parse_byte() {
        assert_eq!(parse_byte("aa"), Ok(0xAA));
        assert_eq!(parse_byte("0x77"), Ok(0x77));
        assert!(parse_byte("100").is_err());
    }

    #[test]
    fn test_meter_samples_once_per_second() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(start);

        meter.record(1000);
        assert!(meter.tick(start + Duration::from_millis(500)).is_none());

        meter.record(1000);
        let sample = meter.tick(start + Duration::from_secs(2)).unwrap();
        assert_eq!(sample.packets, 2);
        assert_eq!(sample.total_bytes, 2000);
        assert_eq!(sample.bytes_per_sec, 1000.0);

        meter.record(500);
        let sample = meter.tick(start + Duration::from_secs(3)).unwrap();
        assert_eq!(sample.bytes_per_sec, 500.0);
    }

    #[test]
    fn test_meter_summary() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(start);
        for _ in 0..4 {
            meter.record(250);
        }

        let summary = meter.summary(start + Duration::from_secs(2));
        assert_eq!(summary.packets, 4);
        assert_eq!(summary.total_bytes, 1000);
        assert_eq!(summary.bytes_per_sec, 500.0);
        assert_eq!(summary.last_second_bytes_per_sec, None);

        let empty = ThroughputMeter::new(start).summary(start);
        assert_eq!(empty.bytes_per_sec, 0.0);
    }

    #[test]
    fn test_summary_keeps_last_active_second() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(start);

        meter.record(3000);
        meter.tick(start + Duration::from_secs(1)).unwrap();
        meter.record(2000);
        meter.tick(start + Duration::from_secs(2)).unwrap();

        // An idle second does not replace the last active rate
        meter.tick(start + Duration::from_secs(3)).unwrap();

        let summary = meter.summary(start + Duration::from_secs(3));
        assert_eq!(summary.last_second_bytes_per_sec, Some(2000.0));
    }
}
