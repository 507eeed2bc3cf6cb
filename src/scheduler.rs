use tracing::{debug, warn};

use crate::mqtt::connection::PublishHandle;
use crate::mqtt::message::Reading;
use crate::sensor::{SensorError, SensorSource};

/// Something the scheduler can sample on an interval.
pub trait Sample {
    fn id(&self) -> &str;
    fn interval_secs(&self) -> i64;
    fn acquire(&mut self, now: i64) -> Result<Vec<Reading>, SensorError>;
}

impl Sample for SensorSource {
    fn id(&self) -> &str {
        SensorSource::id(self)
    }

    fn interval_secs(&self) -> i64 {
        SensorSource::interval_secs(self)
    }

    fn acquire(&mut self, now: i64) -> Result<Vec<Reading>, SensorError> {
        SensorSource::acquire(self, now)
    }
}

struct Scheduled<S> {
    source: S,
    last_sampled: Option<i64>,
}

/// Samples each source once its interval has elapsed and hands the readings
/// to the connection manager. Must be ticked at least once per second.
pub struct Scheduler<S = SensorSource> {
    sources: Vec<Scheduled<S>>,
    publisher: PublishHandle,
}

impl<S: Sample> Scheduler<S> {
    pub fn new(sources: Vec<S>, publisher: PublishHandle) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|source| Scheduled {
                    source,
                    last_sampled: None,
                })
                .collect(),
            publisher,
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Runs one pass. With `force` every source is sampled regardless of its
    /// interval. Returns the number of readings forwarded.
    pub fn tick(&mut self, now: i64, force: bool) -> usize {
        let mut forwarded = 0;
        for entry in &mut self.sources {
            let due = match entry.last_sampled {
                None => true,
                Some(last) => now - last >= entry.source.interval_secs(),
            };
            if !due && !force {
                continue;
            }
            // Stamped before sampling so a failing sensor waits a full interval.
            entry.last_sampled = Some(now);

            match entry.source.acquire(now) {
                Ok(readings) => {
                    for reading in readings {
                        debug!("{}", reading);
                        self.publisher.publish(reading);
                        forwarded += 1;
                    }
                }
                Err(e) => warn!("Sampling {} failed: {}", entry.source.id(), e),
            }
        }
        forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::connection::ManagerEvent;
    use tokio::sync::mpsc;

    struct FakeSource {
        id: String,
        interval: i64,
        fail: bool,
        calls: usize,
    }

    impl FakeSource {
        fn new(id: &str, interval: i64, fail: bool) -> Self {
            Self {
                id: id.into(),
                interval,
                fail,
                calls: 0,
            }
        }
    }

    impl Sample for FakeSource {
        fn id(&self) -> &str {
            &self.id
        }

        fn interval_secs(&self) -> i64 {
            self.interval
        }

        fn acquire(&mut self, now: i64) -> Result<Vec<Reading>, SensorError> {
            self.calls += 1;
            if self.fail {
                return Err(SensorError::InvalidData("bus glitch".into()));
            }
            Ok(vec![Reading::measurement(
                format!("{}/lab/temp", self.id),
                now,
                1.0,
            )])
        }
    }

    fn scheduler(sources: Vec<FakeSource>) -> (Scheduler<FakeSource>, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Scheduler::new(sources, PublishHandle::new(tx)), rx)
    }

    fn drain_topics(rx: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> Vec<String> {
        let mut topics = Vec::new();
        while let Ok(ManagerEvent::Publish(reading)) = rx.try_recv() {
            topics.push(reading.topic().to_string());
        }
        topics
    }

    #[test]
    fn samples_each_source_on_its_own_interval() {
        let (mut scheduler, mut rx) = scheduler(vec![
            FakeSource::new("fast", 1, false),
            FakeSource::new("slow", 5, false),
        ]);

        assert_eq!(scheduler.tick(100, false), 2);
        assert_eq!(scheduler.tick(101, false), 1);
        assert_eq!(scheduler.tick(104, false), 1);
        assert_eq!(scheduler.tick(105, false), 2);

        let topics = drain_topics(&mut rx);
        assert_eq!(
            topics.iter().filter(|t| t.starts_with("slow")).count(),
            2
        );
        assert_eq!(topics.len(), 6);
    }

    #[test]
    fn failing_source_is_not_retried_before_its_interval() {
        let (mut scheduler, mut rx) = scheduler(vec![FakeSource::new("bad", 10, true)]);
        for now in 0..10 {
            assert_eq!(scheduler.tick(now, false), 0);
        }
        assert_eq!(scheduler.sources[0].source.calls, 1);
        scheduler.tick(10, false);
        assert_eq!(scheduler.sources[0].source.calls, 2);
        assert!(drain_topics(&mut rx).is_empty());
    }

    #[test]
    fn forced_pass_ignores_intervals() {
        let (mut scheduler, _rx) = scheduler(vec![FakeSource::new("slow", 3600, false)]);
        scheduler.tick(0, false);
        assert_eq!(scheduler.tick(1, false), 0);
        assert_eq!(scheduler.tick(2, true), 1);
        // the forced pass restarts the interval
        assert_eq!(scheduler.tick(3601, false), 0);
    }
}
