use std::time::Instant;
use tdigest::TDigest;

/// Label and duration in microseconds of one timed phase.
pub type LapMicros = (&'static str, f64);

#[derive(Clone, Debug)]
pub struct Stopwatch {
    start_time: Instant,
    laps: Vec<LapMicros>,
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Stopwatch {
    pub fn new() -> Stopwatch {
        Stopwatch {
            start_time: Instant::now(),
            laps: Vec::new(),
        }
    }

    /// Record the time since creation or the previous lap and restart the clock.
    pub fn lap(&mut self, label: &'static str) -> f64 {
        let duration_as_micros = self.start_time.elapsed().as_micros() as f64;
        self.laps.push((label, duration_as_micros));
        self.start_time = Instant::now();
        duration_as_micros
    }

    pub fn get_n(&self) -> usize {
        self.laps.len()
    }

    pub fn total_micros(&self) -> f64 {
        self.laps.iter().map(|(_, micros)| micros).sum()
    }

    pub fn get_percentile_in_micros(&self, q: f64) -> f64 {
        if self.laps.is_empty() {
            return 0.0;
        }
        let t_digest = TDigest::new_with_size(100);
        let durations = self.laps.iter().map(|(_, micros)| *micros).collect();
        let sorted_digest = t_digest.merge_unsorted(durations);
        sorted_digest.estimate_quantile(q)
    }

    pub fn into_laps(self) -> Vec<LapMicros> {
        self.laps
    }
}

#[cfg(test)]
mod stopwatch_test {
    use super::*;

    #[test]
    fn should_record_laps_in_order() {
        let mut stopwatch = Stopwatch::new();
        stopwatch.lap("seed");
        stopwatch.lap("refine");
        assert_eq!(2, stopwatch.get_n());
        assert!(stopwatch.get_percentile_in_micros(0.5) >= 0.0);
        let summed: f64 = stopwatch.clone().into_laps().iter().map(|(_, micros)| micros).sum();
        assert_eq!(summed, stopwatch.total_micros());
        let labels: Vec<&str> = stopwatch.into_laps().into_iter().map(|(label, _)| label).collect();
        assert_eq!(vec!["seed", "refine"], labels);
    }
}
