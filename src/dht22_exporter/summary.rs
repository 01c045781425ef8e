// dht22-exporter - Temperature and humidity metrics exporter for Prometheus
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use prometheus::core::{Collector, Desc};
use prometheus::proto::{Metric, MetricFamily, MetricType, Quantile, Summary};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_QUANTILES: [f64; 3] = [0.5, 0.9, 0.99];
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(600);
const MAX_WINDOW_SAMPLES: usize = 1024;

#[derive(Debug, Default)]
struct State {
    count: u64,
    sum: f64,
    window: VecDeque<(Instant, f64)>,
}

impl State {
    fn expire(&mut self, now: Instant, max_age: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.saturating_duration_since(*at) > max_age || self.window.len() > MAX_WINDOW_SAMPLES {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Prometheus summary of durations, in seconds.
///
/// Count and sum cover every observation since creation. Quantiles only cover
/// observations made within the last `max_age` and are `NaN` when there are none.
#[derive(Clone)]
pub struct DurationSummary {
    desc: Desc,
    quantiles: Vec<f64>,
    max_age: Duration,
    state: Arc<Mutex<State>>,
}

impl DurationSummary {
    pub fn new(name: &str, help: &str) -> Result<Self, prometheus::Error> {
        let desc = Desc::new(name.to_owned(), help.to_owned(), Vec::new(), HashMap::new())?;

        Ok(Self {
            desc,
            quantiles: DEFAULT_QUANTILES.to_vec(),
            max_age: DEFAULT_MAX_AGE,
            state: Default::default(),
        })
    }

    pub fn observe(&self, duration: Duration) {
        self.observe_at(Instant::now(), duration);
    }

    fn observe_at(&self, now: Instant, duration: Duration) {
        let secs = duration.as_secs_f64();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.count += 1;
        state.sum += secs;
        state.window.push_back((now, secs));
        state.expire(now, self.max_age);
    }

    /// Start a timer that observes the elapsed time into this summary when it is
    /// stopped or dropped, whichever comes first.
    pub fn start_timer(&self) -> SummaryTimer<'_> {
        SummaryTimer {
            summary: self,
            start: Instant::now(),
            observed: false,
        }
    }

    /// Number of observations since creation.
    pub fn count(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).count
    }

    /// Sum of all observations since creation, in seconds.
    pub fn sum(&self) -> f64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).sum
    }

    fn snapshot(&self, now: Instant) -> Summary {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.expire(now, self.max_age);

        let mut sorted: Vec<f64> = state.window.iter().map(|(_, v)| *v).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mut summary = Summary::default();
        summary.set_sample_count(state.count);
        summary.set_sample_sum(state.sum);

        for &q in self.quantiles.iter() {
            let mut quantile = Quantile::default();
            quantile.set_quantile(q);
            quantile.set_value(rank(&sorted, q));
            summary.mut_quantile().push(quantile);
        }

        summary
    }
}

/// Nearest-rank quantile of already sorted values.
fn rank(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }

    let idx = (q * sorted.len() as f64).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}

impl fmt::Debug for DurationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurationSummary")
            .field("name", &self.desc.fq_name)
            .field("quantiles", &self.quantiles)
            .field("max_age", &self.max_age)
            .finish()
    }
}

impl Collector for DurationSummary {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut metric = Metric::default();
        metric.set_summary(self.snapshot(Instant::now()));

        let mut family = MetricFamily::default();
        family.set_name(self.desc.fq_name.clone());
        family.set_help(self.desc.help.clone());
        family.set_field_type(MetricType::SUMMARY);
        family.mut_metric().push(metric);

        vec![family]
    }
}

/// Guard that records the time since it was created into a `DurationSummary`
/// exactly once.
#[must_use = "a timer observes nothing useful when dropped immediately"]
pub struct SummaryTimer<'a> {
    summary: &'a DurationSummary,
    start: Instant,
    observed: bool,
}

impl<'a> SummaryTimer<'a> {
    /// Stop the timer, observe the elapsed time, and return it.
    pub fn observe_duration(mut self) -> Duration {
        self.observe()
    }

    fn observe(&mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if !self.observed {
            self.observed = true;
            self.summary.observe(elapsed);
        }

        elapsed
    }
}

impl<'a> Drop for SummaryTimer<'a> {
    fn drop(&mut self) {
        self.observe();
    }
}

#[cfg(test)]
mod test {
    use super::{rank, DurationSummary};
    use prometheus::core::Collector;
    use prometheus::proto::MetricType;
    use std::time::{Duration, Instant};

    fn summary() -> DurationSummary {
        DurationSummary::new("test_duration_seconds", "Test durations").unwrap()
    }

    #[test]
    fn test_rank_empty() {
        assert!(rank(&[], 0.5).is_nan());
    }

    #[test]
    fn test_rank_values() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(5.0, rank(&values, 0.5));
        assert_eq!(9.0, rank(&values, 0.9));
        assert_eq!(10.0, rank(&values, 0.99));
        assert_eq!(1.0, rank(&values, 0.0));
    }

    #[test]
    fn test_observe_count_and_sum() {
        let s = summary();
        s.observe(Duration::from_millis(250));
        s.observe(Duration::from_millis(500));
        s.observe(Duration::from_millis(1250));

        assert_eq!(3, s.count());
        assert!((s.sum() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_timer_observes_once() {
        let s = summary();
        let timer = s.start_timer();
        timer.observe_duration();

        {
            let _timer = s.start_timer();
        }

        assert_eq!(2, s.count());
    }

    #[test]
    fn test_window_expires_but_totals_remain() {
        let s = summary();
        let now = Instant::now();
        s.observe_at(now, Duration::from_secs(1));
        s.observe_at(now, Duration::from_secs(3));

        let fresh = s.snapshot(now);
        assert_eq!(3.0, fresh.get_quantile()[1].get_value());

        let stale = s.snapshot(now + Duration::from_secs(3600));
        assert_eq!(2, stale.get_sample_count());
        assert_eq!(4.0, stale.get_sample_sum());
        assert!(stale.get_quantile().iter().all(|q| q.get_value().is_nan()));
    }

    #[test]
    fn test_collect_summary_family() {
        let s = summary();
        s.observe(Duration::from_secs(2));

        let families = s.collect();
        assert_eq!(1, families.len());

        let family = &families[0];
        assert_eq!("test_duration_seconds", family.get_name());
        assert_eq!(MetricType::SUMMARY, family.get_field_type());

        let summary = family.get_metric()[0].get_summary();
        assert_eq!(1, summary.get_sample_count());
        assert_eq!(3, summary.get_quantile().len());
        assert_eq!(0.5, summary.get_quantile()[0].get_quantile());
    }
}
