//! Statistics over a decoded sample stream.
//!
//! Feed every sample of one dive through [`ProfileSummary::add`]; the
//! accessors then answer the summary fields a record header does not carry.

use super::Sample;

#[derive(Debug, Clone, Default)]
pub struct ProfileSummary {
    /// Time of the last sample point, seconds.
    last_time: u32,
    /// Depth at the last sample point, metres.
    last_depth: f64,
    max_depth: f64,
    /// Time-weighted depth integral, metre-seconds.
    depth_integral: f64,
    depth_count: usize,
    depth_sum: f64,
    first_temperature: Option<f64>,
    min_temperature: Option<f64>,
    max_temperature: Option<f64>,
}

impl ProfileSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sample: &Sample) {
        match *sample {
            Sample::Time(time) => {
                // Weight by time interval
                let dt = time.saturating_sub(self.last_time);
                self.depth_integral += self.last_depth * f64::from(dt);
                self.last_time = time;
            }
            Sample::Depth(depth) => {
                self.max_depth = self.max_depth.max(depth);
                self.depth_sum += depth;
                self.depth_count += 1;
                self.last_depth = depth;
            }
            Sample::Temperature(temperature) => {
                self.first_temperature.get_or_insert(temperature);
                self.min_temperature = Some(
                    self.min_temperature
                        .map_or(temperature, |t| t.min(temperature)),
                );
                self.max_temperature = Some(
                    self.max_temperature
                        .map_or(temperature, |t| t.max(temperature)),
                );
            }
            _ => {}
        }
    }

    /// Seconds from the first to the last sample point.
    pub fn divetime(&self) -> u32 {
        self.last_time
    }

    pub fn max_depth(&self) -> f64 {
        self.max_depth
    }

    /// Time-weighted mean depth; the plain mean when all samples share one
    /// time.
    pub fn avg_depth(&self) -> f64 {
        if self.last_time > 0 {
            self.depth_integral / f64::from(self.last_time)
        } else if self.depth_count > 0 {
            self.depth_sum / self.depth_count as f64
        } else {
            0.0
        }
    }

    pub fn temperature_surface(&self) -> Option<f64> {
        self.first_temperature
    }

    pub fn temperature_minimum(&self) -> Option<f64> {
        self.min_temperature
    }

    pub fn temperature_maximum(&self) -> Option<f64> {
        self.max_temperature
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(samples: &[Sample]) -> ProfileSummary {
        let mut summary = ProfileSummary::new();
        for sample in samples {
            summary.add(sample);
        }
        summary
    }

    #[test]
    fn test_empty_profile() {
        let summary = feed(&[]);
        assert_eq!(summary.divetime(), 0);
        assert_eq!(summary.avg_depth(), 0.0);
        assert_eq!(summary.temperature_minimum(), None);
    }

    #[test]
    fn test_square_profile() {
        let summary = feed(&[
            Sample::Time(0),
            Sample::Depth(0.0),
            Sample::Time(60),
            Sample::Depth(20.0),
            Sample::Temperature(18.0),
            Sample::Time(660),
            Sample::Depth(20.0),
            Sample::Temperature(14.5),
            Sample::Time(720),
            Sample::Depth(0.0),
        ]);
        assert_eq!(summary.divetime(), 720);
        assert_eq!(summary.max_depth(), 20.0);
        // 0 m for the first minute, 20 m for the next eleven
        let expected = 20.0 * 660.0 / 720.0;
        assert!((summary.avg_depth() - expected).abs() < 1e-9);
        assert_eq!(summary.temperature_surface(), Some(18.0));
        assert_eq!(summary.temperature_minimum(), Some(14.5));
        assert_eq!(summary.temperature_maximum(), Some(18.0));
    }
}
