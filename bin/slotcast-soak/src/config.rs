use std::time::Duration;

use serde::Deserialize;

const fn default_num_slots() -> u8 {
    16
}

const fn default_producer_interval_us() -> u64 {
    50
}

const fn default_flush_interval_ms() -> u64 {
    16
}

const fn default_duration_secs() -> u64 {
    5
}

/// Soak run configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct SoakConfiguration {
    /// Number of slots per sender.
    #[serde(default = "default_num_slots")]
    pub num_slots: u8,

    /// Time the producer waits between two change messages, in microseconds.
    #[serde(default = "default_producer_interval_us")]
    producer_interval_us: u64,

    /// Time between two flushes, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    flush_interval_ms: u64,

    /// Total duration of the run, in seconds.
    #[serde(default = "default_duration_secs")]
    duration_secs: u64,

    /// Seed for the producer's slot selection.
    #[serde(default)]
    pub seed: u64,
}

impl SoakConfiguration {
    pub fn producer_interval(&self) -> Duration {
        Duration::from_micros(self.producer_interval_us)
    }

    pub fn flush_interval(&self) -> Duration {
        // A zero period makes the flush timer panic.
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}
