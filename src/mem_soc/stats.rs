use std::fmt::Display;

/// Histogram with a fixed number of buckets, bucket width doubles whenever a sample does not fit
#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<u64>,
    bucket_size: u64,
    samples: u64,
    sum: u64,
    min: Option<u64>,
    max: Option<u64>,
}

impl Histogram {
    pub fn new(num_buckets: usize) -> Self {
        assert!(num_buckets >= 2 && num_buckets % 2 == 0, "histogram needs an even number of buckets");
        Self {
            buckets: vec![0; num_buckets],
            bucket_size: 1,
            samples: 0,
            sum: 0,
            min: None,
            max: None,
        }
    }

    pub fn sample(&mut self, value: u64) {
        while value >= self.bucket_size * self.buckets.len() as u64 {
            self.grow();
        }
        self.buckets[(value / self.bucket_size) as usize] += 1;
        self.samples += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    /// merge pairs of buckets into the lower half
    fn grow(&mut self) {
        let len = self.buckets.len();
        for i in 0..len / 2 {
            self.buckets[i] = self.buckets[2 * i] + self.buckets[2 * i + 1];
        }
        for bucket in &mut self.buckets[len / 2..] {
            *bucket = 0;
        }
        self.bucket_size *= 2;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn bucket_size(&self) -> u64 {
        self.bucket_size
    }

    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    pub fn min(&self) -> Option<u64> {
        self.min
    }

    pub fn max(&self) -> Option<u64> {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.sum as f64 / self.samples as f64
        }
    }
}

#[derive(Debug, Clone)]
pub enum StatValue {
    Count(u64),
    Ratio(f64),
    Distribution(Histogram),
}

#[derive(Debug, Clone)]
pub struct StatEntry {
    pub name: &'static str,
    pub value: StatValue,
    pub desc: &'static str,
}

/// Stats of one object, printed as `object.stat value # description`
#[derive(Debug, Clone)]
pub struct StatsGroup {
    pub name: String,
    pub entries: Vec<StatEntry>,
}

impl StatsGroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: vec![],
        }
    }

    pub fn count(mut self, name: &'static str, value: u64, desc: &'static str) -> Self {
        self.entries.push(StatEntry { name, value: StatValue::Count(value), desc });
        self
    }

    pub fn ratio(mut self, name: &'static str, value: f64, desc: &'static str) -> Self {
        self.entries.push(StatEntry { name, value: StatValue::Ratio(value), desc });
        self
    }

    pub fn distribution(mut self, name: &'static str, value: &Histogram, desc: &'static str) -> Self {
        self.entries.push(StatEntry { name, value: StatValue::Distribution(value.clone()), desc });
        self
    }

    pub fn get(&self, name: &str) -> Option<&StatValue> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.value)
    }
}

impl Display for StatsGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            let key = format!("{}.{}", self.name, entry.name);
            match &entry.value {
                StatValue::Count(v) => writeln!(f, "{key:<40} {v:>12} # {}", entry.desc)?,
                StatValue::Ratio(v) => writeln!(f, "{key:<40} {v:>12.6} # {}", entry.desc)?,
                StatValue::Distribution(h) => {
                    writeln!(f, "{:<40} {:>12.2} # {} (mean)", format!("{key}::mean"), h.mean(), entry.desc)?;
                    writeln!(f, "{:<40} {:>12} # {} (samples)", format!("{key}::samples"), h.samples(), entry.desc)?;
                    for (i, count) in h.buckets().iter().enumerate() {
                        if *count == 0 {
                            continue;
                        }
                        let low = i as u64 * h.bucket_size();
                        let bucket = format!("{key}::{}-{}", low, low + h.bucket_size() - 1);
                        writeln!(f, "{bucket:<40} {count:>12}")?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// hits / (hits + misses), zero before the first access
pub fn hit_ratio(hits: u64, misses: u64) -> f64 {
    if hits + misses == 0 {
        0.0
    } else {
        hits as f64 / (hits + misses) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_grows() {
        let mut h = Histogram::new(4);
        h.sample(0);
        h.sample(3);
        assert_eq!(h.bucket_size(), 1);
        assert_eq!(h.buckets(), &[1, 0, 0, 1]);

        h.sample(9);
        assert_eq!(h.bucket_size(), 4);
        assert_eq!(h.buckets(), &[2, 0, 1, 0]);
        assert_eq!(h.samples(), 3);
        assert_eq!(h.min(), Some(0));
        assert_eq!(h.max(), Some(9));
        assert!((h.mean() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_group_display() {
        let group = StatsGroup::new("system.cache")
            .count("hits", 3, "Number of hits")
            .ratio("hit_ratio", hit_ratio(3, 1), "Hit ratio");
        let dump = group.to_string();
        assert!(dump.contains("system.cache.hits"));
        assert!(dump.contains("0.750000"));
        assert!(matches!(group.get("hits"), Some(StatValue::Count(3))));
    }
}
