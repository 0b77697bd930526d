//! RetryPolicy backoff and attempt accounting, on virtual time.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use trickle::error::TrickleError;
use trickle::retry::{AttemptOutcome, RetryError, RetryPolicy, Retryable};

#[derive(Debug, Clone, PartialEq, Eq)]
enum TestError {
    Transient(u32),
    Fatal,
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(n) => write!(f, "transient failure #{n}"),
            Self::Fatal => write!(f, "fatal failure"),
        }
    }
}

impl Retryable for TestError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

// ---------------------------------------------------------------------------
// Scenario: fail, fail, succeed
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn two_transient_failures_then_success() {
    let policy = RetryPolicy::new(3, secs(1), secs(60)).unwrap();
    let calls = AtomicU32::new(0);
    let call_times = std::sync::Mutex::new(Vec::new());
    let start = Instant::now();

    let (result, report) = policy
        .execute_with_report(|attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            call_times.lock().unwrap().push(start.elapsed());
            async move {
                if attempt < 3 {
                    Err(TestError::Transient(attempt))
                } else {
                    Ok("success")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "success");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.attempt_count(), 3);
    assert_eq!(report.delays(), vec![secs(1), secs(2)]);
    assert_eq!(report.attempts[0].delay, Duration::ZERO);
    assert_eq!(report.attempts[2].outcome, AttemptOutcome::Succeeded);

    let times = call_times.lock().unwrap().clone();
    assert_eq!(times[0], Duration::ZERO, "no delay before the first attempt");
    assert!(times[1] >= secs(1) && times[1] < Duration::from_millis(1010));
    assert!(times[2] >= secs(3) && times[2] < Duration::from_millis(3010));
}

#[tokio::test(start_paused = true)]
async fn success_on_first_attempt_does_not_sleep() {
    let policy = RetryPolicy::new(5, secs(1), secs(60)).unwrap();
    let start = Instant::now();

    let result: Result<u32, RetryError<TestError>> = policy.execute(|_| async { Ok(42) }).await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

// ---------------------------------------------------------------------------
// Fail-fast and exhaustion
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn non_retryable_error_consumes_one_attempt() {
    let policy = RetryPolicy::new(5, secs(1), secs(60)).unwrap();
    let calls = AtomicU32::new(0);
    let start = Instant::now();

    let result: Result<(), _> = policy
        .execute(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Fatal) }
        })
        .await;

    assert!(matches!(result, Err(RetryError::Permanent(TestError::Fatal))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn exhaustion_stops_at_max_retries_and_keeps_last_error() {
    let policy = RetryPolicy::new(4, secs(1), secs(60)).unwrap();
    let calls = AtomicU32::new(0);

    let (result, report) = policy
        .execute_with_report(|attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(TestError::Transient(attempt)) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 4, "no 5th attempt");
    match result {
        Err(RetryError::Exhausted { attempts, last }) => {
            assert_eq!(attempts, 4);
            assert_eq!(last, TestError::Transient(4));
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(report.delays(), vec![secs(1), secs(2), secs(4)]);
    assert!(report
        .attempts
        .iter()
        .all(|a| matches!(a.outcome, AttemptOutcome::RetryableFailure(_))));
}

#[tokio::test(start_paused = true)]
async fn single_attempt_budget_never_sleeps() {
    let policy = RetryPolicy::new(1, secs(1), secs(1)).unwrap();
    let start = Instant::now();

    let result: Result<(), _> = policy
        .execute(|n| async move { Err(TestError::Transient(n)) })
        .await;

    assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn retryable_then_fatal_stops_on_fatal() {
    let policy = RetryPolicy::new(5, secs(1), secs(60)).unwrap();

    let (result, report) = policy
        .execute_with_report(|attempt| async move {
            if attempt == 1 {
                Err::<(), _>(TestError::Transient(1))
            } else {
                Err(TestError::Fatal)
            }
        })
        .await;

    assert!(matches!(result, Err(RetryError::Permanent(TestError::Fatal))));
    assert_eq!(report.attempt_count(), 2);
    assert!(matches!(
        report.attempts[1].outcome,
        AttemptOutcome::PermanentFailure(_)
    ));
}

// ---------------------------------------------------------------------------
// Backoff envelope
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn observed_delays_follow_capped_doubling() {
    let policy = RetryPolicy::new(6, secs(1), secs(3)).unwrap();

    let (_, report) = policy
        .execute_with_report(|n| async move { Err::<(), _>(TestError::Transient(n)) })
        .await;

    assert_eq!(report.delays(), vec![secs(1), secs(2), secs(3), secs(3), secs(3)]);
}

#[test]
fn delay_formula_holds_for_many_attempts() {
    let base = Duration::from_millis(250);
    let cap = Duration::from_secs(30);
    let policy = RetryPolicy::new(64, base, cap).unwrap();

    let mut previous = Duration::ZERO;
    for n in 2..=64u32 {
        let expected = 2u64
            .checked_pow(n - 2)
            .and_then(|factor| (base.as_millis() as u64).checked_mul(factor))
            .map_or(cap, |ms| Duration::from_millis(ms).min(cap));
        let actual = policy.delay_before(n);
        assert_eq!(actual, expected, "attempt {n}");
        assert!(actual >= previous, "delays must not decrease");
        previous = actual;
    }
    assert_eq!(previous, cap);
}

// ---------------------------------------------------------------------------
// Cancellation and independence
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancelled_backoff_returns_promptly() {
    let token = CancellationToken::new();
    let policy = RetryPolicy::new(5, secs(10), secs(60))
        .unwrap()
        .with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(secs(2)).await;
        token.cancel();
    });

    let start = Instant::now();
    let result: Result<(), _> = policy
        .execute(|n| async move { Err(TestError::Transient(n)) })
        .await;

    match result {
        Err(RetryError::Cancelled { attempts, last }) => {
            assert_eq!(attempts, 1);
            assert_eq!(last, TestError::Transient(1));
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert!(start.elapsed() < secs(3));
    canceller.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn concurrent_invocations_back_off_independently() {
    let policy = Arc::new(RetryPolicy::new(3, secs(1), secs(60)).unwrap());
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let policy = policy.clone();
        handles.push(tokio::spawn(async move {
            let (result, _) = policy
                .execute_with_report(|n| async move {
                    if n < 3 {
                        Err(TestError::Transient(n))
                    } else {
                        Ok(n)
                    }
                })
                .await;
            result.unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 3);
    }

    // Each invocation sleeps 1s + 2s; run side by side they finish together.
    let elapsed = start.elapsed();
    assert!(elapsed >= secs(3) && elapsed < Duration::from_millis(3050), "took {elapsed:?}");
}

// ---------------------------------------------------------------------------
// TrickleError integration
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn exhausted_trickle_error_converts_with_source() {
    let policy = RetryPolicy::new(2, secs(1), secs(1)).unwrap();

    let result: Result<(), _> = policy
        .execute(|_| async {
            Err(TrickleError::RateLimited {
                provider: "openai".to_string(),
            })
        })
        .await;

    let err: TrickleError = result.unwrap_err().into();
    match err {
        TrickleError::RetriesExhausted { attempts, ref last } => {
            assert_eq!(attempts, 2);
            assert!(matches!(**last, TrickleError::RateLimited { .. }));
        }
        ref other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert!(std::error::Error::source(&err).is_some());
    assert!(err.user_message().contains("2 attempts"));
}
