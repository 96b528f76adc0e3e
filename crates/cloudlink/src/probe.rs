use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;

/// Interval between two diagnostics while the network stays not ready.
pub const DIAGNOSTIC_INTERVAL: Duration = Duration::from_secs(5);

/// Readiness predicates exposed by the platform.
///
/// Both predicates are polled; an implementation must not retry internally.
pub trait NetworkProbe {
    /// Checks whether the device has a usable network link.
    ///
    /// # Errors
    ///
    /// The link state cannot be determined.
    fn networking_ready(&mut self) -> Result<bool>;

    /// Checks whether the device credential is available.
    ///
    /// # Errors
    ///
    /// The credential state cannot be determined.
    fn device_auth_ready(&mut self) -> Result<bool>;
}

/// The outcome of a readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Network and credential are both ready.
    Ready,
    /// The network is not ready.
    NetworkingNotReady,
    /// The credential is not ready.
    AuthNotReady,
    /// A probe has failed.
    ProbeFailed,
}

impl Readiness {
    /// Checks whether the device can connect.
    ///
    /// A failed probe counts as not ready.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => "ready",
            Self::NetworkingNotReady => "networking not ready",
            Self::AuthNotReady => "device authentication not ready",
            Self::ProbeFailed => "readiness probe failed",
        }
        .fmt(f)
    }
}

/// Checks a [`NetworkProbe`] and rate-limits the diagnostics about a network
/// which stays not ready.
#[derive(Debug, Default)]
pub struct ReadinessMonitor {
    not_ready_since: Option<Duration>,
    last_diagnostic: Option<Duration>,
    diagnostics: u32,
}

impl ReadinessMonitor {
    /// Creates a [`ReadinessMonitor`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            not_ready_since: None,
            last_diagnostic: None,
            diagnostics: 0,
        }
    }

    /// Checks the probe at the given loop time.
    pub fn check<N: NetworkProbe + ?Sized>(&mut self, probe: &mut N, now: Duration) -> Readiness {
        let readiness = match probe.networking_ready() {
            Ok(true) => match probe.device_auth_ready() {
                Ok(true) => Readiness::Ready,
                Ok(false) => Readiness::AuthNotReady,
                Err(e) => {
                    debug!("Device authentication probe failed: {e}");
                    Readiness::ProbeFailed
                }
            },
            Ok(false) => Readiness::NetworkingNotReady,
            Err(e) => {
                debug!("Networking probe failed: {e}");
                Readiness::ProbeFailed
            }
        };

        if readiness.is_ready() {
            self.not_ready_since = None;
            self.last_diagnostic = None;
            return readiness;
        }

        let since = *self.not_ready_since.get_or_insert(now);
        let last = self.last_diagnostic.unwrap_or(since);
        if now.saturating_sub(last) >= DIAGNOSTIC_INTERVAL {
            warn!(
                "Network unavailable for {}s: {readiness}",
                now.saturating_sub(since).as_secs()
            );
            self.last_diagnostic = Some(now);
            self.diagnostics += 1;
        }

        readiness
    }

    /// Returns the number of diagnostics emitted so far.
    #[must_use]
    pub const fn diagnostics(&self) -> u32 {
        self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::{Error, ErrorKind, Result};

    use super::{NetworkProbe, Readiness, ReadinessMonitor};

    struct Probe {
        networking: Result<bool>,
        auth: Result<bool>,
    }

    impl NetworkProbe for Probe {
        fn networking_ready(&mut self) -> Result<bool> {
            self.networking.clone()
        }

        fn device_auth_ready(&mut self) -> Result<bool> {
            self.auth.clone()
        }
    }

    #[test]
    fn readiness_outcomes() {
        let mut monitor = ReadinessMonitor::new();
        let now = Duration::ZERO;

        let mut probe = Probe {
            networking: Ok(true),
            auth: Ok(true),
        };
        assert_eq!(monitor.check(&mut probe, now), Readiness::Ready);

        probe.auth = Ok(false);
        assert_eq!(monitor.check(&mut probe, now), Readiness::AuthNotReady);

        probe.networking = Ok(false);
        assert_eq!(monitor.check(&mut probe, now), Readiness::NetworkingNotReady);

        probe.networking = Err(Error::new(ErrorKind::Network, "No interfaces"));
        let readiness = monitor.check(&mut probe, now);
        assert_eq!(readiness, Readiness::ProbeFailed);
        assert!(!readiness.is_ready());
    }

    #[test]
    fn diagnostics_every_five_seconds() {
        let mut monitor = ReadinessMonitor::new();
        let mut probe = Probe {
            networking: Ok(false),
            auth: Ok(true),
        };

        for tick in 0..=120u64 {
            let _ = monitor.check(&mut probe, Duration::from_millis(tick * 100));
        }
        // 12 seconds of continuous unavailability: diagnostics at 5s and 10s.
        assert_eq!(monitor.diagnostics(), 2);

        // Readiness restarts the interval.
        probe.networking = Ok(true);
        let _ = monitor.check(&mut probe, Duration::from_secs(13));
        probe.networking = Ok(false);
        let _ = monitor.check(&mut probe, Duration::from_secs(14));
        let _ = monitor.check(&mut probe, Duration::from_millis(18_900));
        assert_eq!(monitor.diagnostics(), 2);
        let _ = monitor.check(&mut probe, Duration::from_secs(19));
        assert_eq!(monitor.diagnostics(), 3);
    }
}
