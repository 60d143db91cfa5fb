use std::time::{Duration, Instant};

use log::info;

/// Logs the receive rate at most once per `threshold`.
pub struct Printer {
    received_last: u64,

    threshold: Duration,
    last_print_time: Instant,
}

impl Printer {
    #[inline]
    pub fn new(threshold: Duration) -> Self {
        Self {
            received_last: 0,

            threshold,
            last_print_time: Instant::now(),
        }
    }

    #[inline]
    pub fn tick(&mut self, received: u64) {
        let elapsed = self.last_print_time.elapsed();
        if elapsed < self.threshold {
            return;
        }

        let packets_per_second =
            received.saturating_sub(self.received_last) as f64 / elapsed.as_secs_f64();
        if packets_per_second > 10_000_000. {
            info!("{} mpps", (packets_per_second / 1_000_000.).round() as u64)
        } else if packets_per_second > 10_000. {
            info!("{} kpps", (packets_per_second / 1_000.).round() as u64)
        } else {
            info!("{} pps", packets_per_second.round() as u64)
        };

        self.received_last = received;
        self.last_print_time = Instant::now();
    }
}
