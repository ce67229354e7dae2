use anyhow::{Context, Result};
use rsntp::SntpClient;
use std::time::Duration;

use crate::traits::{NtpSample, NtpSource};

/// Blocking SNTP reference probe.
pub struct NtpClient {
    server: String,
    timeout: Duration,
}

impl NtpClient {
    pub fn new(server: &str, timeout: Duration) -> Self {
        NtpClient {
            server: server.to_string(),
            timeout,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}

/// Seconds from rsntp into signed milliseconds.
/// Positive offset means the local clock is behind the reference.
fn secs_to_ms(secs: f64) -> f64 {
    secs * 1000.0
}

impl NtpSource for NtpClient {
    fn sample(&self) -> Result<NtpSample> {
        let mut client = SntpClient::new();
        client.set_timeout(self.timeout);
        let result = client
            .synchronize(&self.server)
            .with_context(|| format!("NTP query to {} failed", self.server))?;

        Ok(NtpSample {
            offset_ms: secs_to_ms(result.clock_offset().as_secs_f64()),
            round_trip_ms: secs_to_ms(result.round_trip_delay().as_secs_f64()),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_conversion_keeps_sign() {
        assert_eq!(secs_to_ms(1.5), 1500.0);
        assert_eq!(secs_to_ms(-2.25), -2250.0);
        assert_eq!(secs_to_ms(0.0), 0.0);
    }

    #[test]
    fn test_offset_conversion_sub_millisecond() {
        // 500us
        assert!((secs_to_ms(0.000500) - 0.5).abs() < 1e-9);
        // 2ms
        assert!((secs_to_ms(0.002) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_ntp_client_new() {
        let client = NtpClient::new("pool.ntp.org", Duration::from_secs(3));
        assert_eq!(client.server(), "pool.ntp.org");
        assert_eq!(client.timeout, Duration::from_secs(3));
    }

    #[test]
    #[ignore] // needs DNS; run with: cargo test -- --ignored
    fn test_unresolvable_server_is_error() {
        let client = NtpClient::new("ntp.invalid.", Duration::from_millis(200));
        let err = client.sample().unwrap_err();
        assert!(err.to_string().contains("ntp.invalid."));
    }
}
