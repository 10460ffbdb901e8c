use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs for a [crate::DirectoryNode]. Every field is optional; unset fields take defaults.
#[derive(Clone, Default)]
pub struct RaftOptions {
    /// How long the leader waits for one AppendEntries or RequestVote reply.
    pub append_entries_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// How long a write may wait to reach the head of the write queue.
    pub write_queue_timeout: Option<Duration>,
    /// Extra fan-out attempts for followers that did not acknowledge an entry.
    pub consensus_retries: Option<u32>,
    /// Base delay between fan-out attempts. Attempt `n` waits `n * backoff` plus up to `backoff` of jitter.
    pub consensus_retry_backoff: Option<Duration>,
    /// Applied entries in the current log segment before it is rotated. 0 disables rotation.
    pub log_rotation_threshold: Option<usize>,
}

#[derive(Clone, Debug)]
pub(super) struct RaftOptionsValidated {
    pub append_entries_timeout: Duration,
    pub connect_timeout: Duration,
    pub write_queue_timeout: Duration,
    pub consensus_retries: u32,
    pub consensus_retry_backoff: Duration,
    pub log_rotation_threshold: usize,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.append_entries_timeout == Duration::from_millis(0) {
            return Err("AppendEntries timeout must be non-zero");
        }
        if self.connect_timeout == Duration::from_millis(0) {
            return Err("Connect timeout must be non-zero");
        }
        if self.write_queue_timeout <= self.append_entries_timeout {
            return Err("Write queue timeout must be greater than the AppendEntries timeout");
        }
        if self.consensus_retry_backoff >= self.write_queue_timeout {
            return Err("Consensus retry backoff must be less than the write queue timeout");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            append_entries_timeout: options.append_entries_timeout.unwrap_or(Duration::from_millis(300)),
            connect_timeout: options.connect_timeout.unwrap_or(Duration::from_millis(500)),
            write_queue_timeout: options.write_queue_timeout.unwrap_or(Duration::from_secs(30)),
            consensus_retries: options.consensus_retries.unwrap_or(2),
            consensus_retry_backoff: options.consensus_retry_backoff.unwrap_or(Duration::from_millis(50)),
            log_rotation_threshold: options.log_rotation_threshold.unwrap_or(1000),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let validated = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();
        assert_eq!(validated.append_entries_timeout, Duration::from_millis(300));
        assert_eq!(validated.connect_timeout, Duration::from_millis(500));
        assert_eq!(validated.write_queue_timeout, Duration::from_secs(30));
        assert_eq!(validated.consensus_retries, 2);
        assert_eq!(validated.consensus_retry_backoff, Duration::from_millis(50));
        assert_eq!(validated.log_rotation_threshold, 1000);
    }

    #[test]
    fn cross_validation() {
        fn run(options: RaftOptions, valid: bool) {
            assert_eq!(RaftOptionsValidated::try_from(options).is_ok(), valid);
        }

        run(
            RaftOptions {
                append_entries_timeout: Some(Duration::from_millis(0)),
                ..RaftOptions::default()
            },
            false,
        );
        run(
            RaftOptions {
                connect_timeout: Some(Duration::from_millis(0)),
                ..RaftOptions::default()
            },
            false,
        );
        run(
            RaftOptions {
                write_queue_timeout: Some(Duration::from_millis(300)),
                ..RaftOptions::default()
            },
            false,
        );
        run(
            RaftOptions {
                write_queue_timeout: Some(Duration::from_secs(1)),
                consensus_retry_backoff: Some(Duration::from_secs(2)),
                ..RaftOptions::default()
            },
            false,
        );
        run(
            RaftOptions {
                consensus_retries: Some(0),
                log_rotation_threshold: Some(0),
                ..RaftOptions::default()
            },
            true,
        );
    }
}
