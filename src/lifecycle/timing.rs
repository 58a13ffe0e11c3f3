use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

/// Start and stop checkpoints of one lifecycle, reported at info level.
#[derive(Debug, Default)]
pub(crate) struct Timing {
    first_start: Option<DateTime<Local>>,
    start_mark: Option<Instant>,
    started_in: Option<Duration>,
    stop_mark: Option<Instant>,
}

impl Timing {
    pub(crate) fn mark_start(&mut self) {
        self.first_start.get_or_insert_with(Local::now);
        self.start_mark = Some(Instant::now());
    }

    pub(crate) fn mark_started(&mut self, name: &str) {
        let elapsed = self.start_mark.map(|mark| mark.elapsed()).unwrap_or_default();
        self.started_in = Some(elapsed);
        tracing::info!(
            "{} started in {:.3}s (first start at {})",
            name,
            elapsed.as_secs_f64(),
            self.first_start
                .map(|at| at.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
                .unwrap_or_default()
        );
    }

    pub(crate) fn mark_stop(&mut self) {
        self.stop_mark = Some(Instant::now());
    }

    pub(crate) fn print_stop_time(&self, name: &str) {
        let elapsed = self.stop_mark.map(|mark| mark.elapsed()).unwrap_or_default();
        tracing::info!("{} stopped in {:.3}s", name, elapsed.as_secs_f64());
    }

    pub(crate) fn started_in(&self) -> Option<Duration> {
        self.started_in
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoints() {
        let mut timing = Timing::default();
        assert!(timing.started_in().is_none());

        timing.mark_start();
        let first = timing.first_start;
        timing.mark_started("app");
        assert!(timing.started_in().is_some());

        timing.mark_start();
        assert_eq!(timing.first_start, first);

        timing.mark_stop();
        assert!(timing.stop_mark.is_some());
    }
}
