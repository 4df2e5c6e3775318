//! Retry with exponential backoff
//!
//! Every external call runs under the configured timeout; timeouts and other
//! retryable failures are retried with jittered exponential backoff. A
//! cancelled token stops both the in-flight call and any pending sleep, and
//! whatever the call would have returned is dropped.

use crate::config::{PipelineConfig, RetryPolicy};
use crate::error::GenerationError;
use crate::generator::{ExternalGenerator, GenerationRequest};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result of a retried generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RetryOutcome {
    Generated(String),
    /// Attempts exhausted or a permanent failure
    Failed {
        error: GenerationError,
        attempts: u32,
    },
    Cancelled,
}

/// Apply the policy's jitter to a base delay
fn jittered(policy: &RetryPolicy, base: Duration) -> Duration {
    if policy.jitter <= 0.0 || base.is_zero() {
        return base;
    }
    let spread = rand::rng().random_range(-policy.jitter..=policy.jitter);
    base.mul_f64((1.0 + spread).max(0.0))
}

/// Delay before the next attempt, honoring a rate limiter's hint
fn next_delay(policy: &RetryPolicy, failed_attempts: u32, error: &GenerationError) -> Duration {
    let backoff = jittered(policy, policy.base_delay(failed_attempts));
    match error {
        GenerationError::RateLimited {
            retry_after_ms: Some(ms),
        } => backoff.max(Duration::from_millis(*ms)),
        _ => backoff,
    }
}

/// Run `request` against `generator` until it succeeds, fails permanently,
/// exhausts the policy or is cancelled
pub(crate) async fn generate_with_retry(
    generator: &dyn ExternalGenerator,
    config: &PipelineConfig,
    request: &GenerationRequest,
    cancel: &CancellationToken,
) -> RetryOutcome {
    let policy = config.retry;
    let timeout = config.generation_timeout();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let call = tokio::time::timeout(timeout, generator.generate(&config.generator, request));
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return RetryOutcome::Cancelled,
            result = call => result.unwrap_or(Err(GenerationError::Timeout {
                secs: config.generation_timeout_secs,
            })),
        };

        let error = match result {
            Ok(output) => return RetryOutcome::Generated(output),
            Err(error) => error,
        };
        if !error.is_retryable() || attempts >= policy.max_attempts {
            tracing::error!(
                stage = %request.stage,
                file = request.file.as_ref().map(|f| f.path.as_str()),
                attempts,
                error = %error,
                "generation failed"
            );
            return RetryOutcome::Failed { error, attempts };
        }

        let delay = next_delay(&policy, attempts, &error);
        tracing::warn!(
            stage = %request.stage,
            file = request.file.as_ref().map(|f| f.path.as_str()),
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "generation attempt failed, retrying"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => return RetryOutcome::Cancelled,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeneratorSettings;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use stagecraft_artifact::Stage;
    use std::collections::VecDeque;

    #[derive(Debug)]
    struct Sequence(Mutex<VecDeque<Result<String, GenerationError>>>);

    impl Sequence {
        fn new(items: Vec<Result<String, GenerationError>>) -> Self {
            Self(Mutex::new(items.into()))
        }
    }

    #[async_trait]
    impl ExternalGenerator for Sequence {
        async fn generate(
            &self,
            _settings: &GeneratorSettings,
            _request: &GenerationRequest,
        ) -> Result<String, GenerationError> {
            self.0
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(GenerationError::Permanent("script exhausted".into())))
        }
    }

    #[derive(Debug)]
    struct Hang;

    #[async_trait]
    impl ExternalGenerator for Hang {
        async fn generate(
            &self,
            _settings: &GeneratorSettings,
            _request: &GenerationRequest,
        ) -> Result<String, GenerationError> {
            futures::future::pending().await
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default().with_retry(RetryPolicy::immediate(3))
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new(Stage::RequirementsText, "brief")
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let generator = Sequence::new(vec![
            Err(GenerationError::Transient("reset".into())),
            Err(GenerationError::RateLimited { retry_after_ms: None }),
            Ok("done".into()),
        ]);
        let outcome =
            generate_with_retry(&generator, &config(), &request(), &CancellationToken::new()).await;
        assert_eq!(outcome, RetryOutcome::Generated("done".into()));
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let generator = Sequence::new(vec![
            Err(GenerationError::Transient("1".into())),
            Err(GenerationError::Transient("2".into())),
            Err(GenerationError::Transient("3".into())),
            Ok("too late".into()),
        ]);
        let outcome =
            generate_with_retry(&generator, &config(), &request(), &CancellationToken::new()).await;
        assert_eq!(
            outcome,
            RetryOutcome::Failed {
                error: GenerationError::Transient("3".into()),
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn permanent_failures_stop_immediately() {
        let generator = Sequence::new(vec![
            Err(GenerationError::Permanent("bad request".into())),
            Ok("unreachable".into()),
        ]);
        let outcome =
            generate_with_retry(&generator, &config(), &request(), &CancellationToken::new()).await;
        assert!(matches!(outcome, RetryOutcome::Failed { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_calls_time_out_and_count_as_attempts() {
        let config = config().with_generation_timeout_secs(5);
        let outcome =
            generate_with_retry(&Hang, &config, &request(), &CancellationToken::new()).await;
        assert_eq!(
            outcome,
            RetryOutcome::Failed {
                error: GenerationError::Timeout { secs: 5 },
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn cancellation_discards_the_call() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let generator = Sequence::new(vec![Ok("ignored".into())]);
        let outcome = generate_with_retry(&generator, &config(), &request(), &cancel).await;
        assert_eq!(outcome, RetryOutcome::Cancelled);
    }

    #[test]
    fn rate_limit_hint_extends_the_delay() {
        let policy = RetryPolicy::immediate(3);
        let delay = next_delay(
            &policy,
            1,
            &GenerationError::RateLimited {
                retry_after_ms: Some(250),
            },
        );
        assert_eq!(delay, Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = jittered(&policy, Duration::from_millis(1_000));
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1_250));
        }
    }
}
