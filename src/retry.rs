//! Bounded retry with increasing backoff for transient forwarding failures

use std::future::Future;
use std::io;
use std::time::Duration;
use tracing::warn;

/// Ordered, finite sequence of backoff delays.
///
/// Attempt `n` (zero based) that fails transiently is followed by
/// `delays[n]`; once the sequence is exhausted the failure is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(5),
        ])
    }
}

/// Terminal outcome of [`RetryPolicy::run`]
#[derive(Debug)]
pub struct RetryError<E> {
    /// The error of the final attempt
    pub error: E,
    /// Total attempts made, including the first
    pub attempts: usize,
    /// Whether the final error was transient (i.e. the budget ran out)
    pub exhausted: bool,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Number of retries after the initial attempt
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    /// Delay before retry `attempt`, or `None` once exhausted
    pub fn delay_for(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    /// Drive `op` until it succeeds, fails non-transiently, or the delays run out.
    ///
    /// `op` receives the zero-based attempt number.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, is_transient: P) -> Result<T, RetryError<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !is_transient(&error) {
                        return Err(RetryError {
                            error,
                            attempts: attempt + 1,
                            exhausted: false,
                        });
                    }
                    match self.delay_for(attempt) {
                        Some(delay) => {
                            warn!(
                                attempt = attempt + 1,
                                retry_in_ms = delay.as_millis() as u64,
                                error = %error,
                                "Transient backend error, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => {
                            return Err(RetryError {
                                error,
                                attempts: attempt + 1,
                                exhausted: true,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Socket-level failures worth retrying: the backend is restarting or
/// momentarily not accepting connections.
pub fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[derive(Debug)]
    enum TestError {
        Refused,
        BadRequest,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn transient(e: &TestError) -> bool {
        matches!(e, TestError::Refused)
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.len(), 3);
        assert_eq!(policy.delay_for(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for(3), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_all_delays() {
        let policy = RetryPolicy::default();
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let recorder = Arc::clone(&stamps);
        let result: Result<(), _> = policy
            .run(
                move |_| {
                    recorder.lock().push(Instant::now());
                    async { Err(TestError::Refused) }
                },
                transient,
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.exhausted);
        assert_eq!(err.attempts, policy.len() + 1);

        let stamps = stamps.lock();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), policy.len());
        for (gap, expected) in gaps.iter().zip([1, 2, 5]) {
            assert!(*gap >= Duration::from_secs(expected));
        }
        assert!(gaps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_error_is_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = policy
            .run(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError::BadRequest) }
                },
                transient,
            )
            .await;

        let err = result.unwrap_err();
        assert!(!err.exhausted);
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_mid_sequence() {
        let policy = RetryPolicy::new(vec![Duration::from_millis(10), Duration::from_millis(20)]);

        let result = policy
            .run(
                |attempt| async move {
                    if attempt < 1 {
                        Err(TestError::Refused)
                    } else {
                        Ok(attempt)
                    }
                },
                transient,
            )
            .await;

        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn test_transient_io_kinds() {
        assert!(is_transient_io(io::ErrorKind::ConnectionRefused));
        assert!(is_transient_io(io::ErrorKind::ConnectionReset));
        assert!(is_transient_io(io::ErrorKind::TimedOut));
        assert!(!is_transient_io(io::ErrorKind::InvalidData));
        assert!(!is_transient_io(io::ErrorKind::PermissionDenied));
    }
}
