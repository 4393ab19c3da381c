use std::time::Duration;

use tokio::time::Instant;

use crate::config::Timing;

/// Chooses the poll interval.
///
/// Each successful reservation re-arms a window of `boost_time` during which
/// the queue polls at `boost_poll_interval`, so bursts drain quickly while an
/// idle queue only costs one query per `poll_interval`.
#[derive(Debug, Clone)]
pub(crate) struct Boost {
    poll_interval: Duration,
    boost_poll_interval: Duration,
    boost_time: Duration,
    last_reservation: Option<Instant>,
}

impl Boost {
    pub fn new(timing: &Timing) -> Self {
        Self {
            poll_interval: timing.poll_interval,
            boost_poll_interval: timing.boost_poll_interval,
            boost_time: timing.boost_time,
            last_reservation: None,
        }
    }

    pub fn record_reservation(&mut self, at: Instant) {
        self.last_reservation = Some(at);
    }

    pub fn is_active(&self, now: Instant) -> bool {
        self.last_reservation
            .is_some_and(|last| last + self.boost_time > now)
    }

    pub fn interval_at(&self, now: Instant) -> Duration {
        if self.is_active(now) {
            self.boost_poll_interval
        } else {
            self.poll_interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> Timing {
        Timing {
            default_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            boost_poll_interval: Duration::from_millis(500),
            boost_time: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_idle_uses_poll_interval() {
        let boost = Boost::new(&timing());
        assert_eq!(boost.interval_at(Instant::now()), Duration::from_secs(1));
    }

    #[test]
    fn test_boost_window() {
        let mut boost = Boost::new(&timing());
        let start = Instant::now();

        boost.record_reservation(start);

        assert_eq!(boost.interval_at(start), Duration::from_millis(500));
        assert_eq!(
            boost.interval_at(start + Duration::from_secs(9)),
            Duration::from_millis(500)
        );
        assert_eq!(
            boost.interval_at(start + Duration::from_secs(10)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_reservation_rearms_window() {
        let mut boost = Boost::new(&timing());
        let start = Instant::now();

        boost.record_reservation(start);
        boost.record_reservation(start + Duration::from_secs(8));

        assert!(boost.is_active(start + Duration::from_secs(15)));
        assert!(!boost.is_active(start + Duration::from_secs(18)));
    }
}
