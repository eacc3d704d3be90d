use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use crate::core::{ErrorKind, Result, UploadError};

/// 抖动因子来源, 返回 [0.5, 1.0] 之间的值
pub type JitterSource = Arc<dyn Fn() -> f64 + Send + Sync>;

/// 重试前回调, 参数为失败的尝试序号 (从 1 开始) 和错误
pub type RetryCallback = Arc<dyn Fn(u32, &UploadError) -> Result<()> + Send + Sync>;

/// 重试策略
///
/// Between attempt `k` and `k + 1` the engine sleeps
/// `min(base_delay * exponential_base^(k-1), max_delay)`, scaled by a factor
/// in `[0.5, 1.0]` when jitter is on. Only errors whose kind is in
/// `retryable` are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
    pub retryable: HashSet<ErrorKind>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, exponential_base: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            exponential_base,
            jitter: true,
            retryable: HashSet::from([ErrorKind::TransientService]),
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    /// Network transfer of one file.
    pub fn upload() -> Self {
        Self::new(3, Duration::from_secs(2), Duration::from_secs(30), 2.0)
            .with_retryable([ErrorKind::TransientService, ErrorKind::FileOperation])
    }

    /// Local delete/move/copy.
    pub fn file_operation() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(10), 1.5)
            .with_retryable([ErrorKind::FileOperation])
    }

    /// Remote metadata calls such as channel listing.
    pub fn api() -> Self {
        Self::new(3, Duration::from_secs(5), Duration::from_secs(60), 2.0)
            .with_retryable([ErrorKind::TransientService])
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0).with_retryable([])
    }

    pub fn is_retryable(&self, error: &UploadError) -> bool {
        self.retryable.contains(&error.kind())
    }

    /// 计算第 `attempt` 次尝试失败后的延迟 (不含抖动)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Upper bound on the total time spent sleeping between attempts.
    pub fn max_total_delay(&self) -> Duration {
        self.max_delay * self.max_attempts.saturating_sub(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::upload()
    }
}

fn default_jitter() -> f64 {
    rand::thread_rng().gen_range(0.5..=1.0)
}

/// 重试执行器
///
/// ```no_run
/// # use clipdrop::utils::retry::{Retrier, RetryPolicy};
/// # async fn demo() -> clipdrop::Result<()> {
/// let value = Retrier::new(RetryPolicy::api())
///     .name("list_channels")
///     .run(|| async { Ok::<_, clipdrop::UploadError>(42) })
///     .await?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    name: String,
    jitter: JitterSource,
    on_retry: Option<RetryCallback>,
    cancel: Option<CancellationToken>,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            name: "operation".to_string(),
            jitter: Arc::new(default_jitter),
            on_retry: None,
            cancel: None,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Operation name used in log lines.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn jitter<F>(mut self, source: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.jitter = Arc::new(source);
        self
    }

    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, &UploadError) -> Result<()> + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Back-off sleeps end early with [`UploadError::Cancelled`] once
    /// `token` is cancelled.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.policy.delay_for_attempt(attempt);
        if !self.policy.jitter {
            return delay;
        }
        let factor = (self.jitter)().clamp(0.5, 1.0);
        delay.mul_f64(factor)
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => Err(UploadError::Cancelled),
                    _ = sleep(delay) => Ok(()),
                }
            }
            None => {
                sleep(delay).await;
                Ok(())
            }
        }
    }

    /// 执行带重试的操作
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if self.cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
                return Err(UploadError::Cancelled);
            }

            debug!(operation = %self.name, attempt, max_attempts, "executing");
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            // 不可重试的错误直接返回
            if !self.policy.is_retryable(&error) {
                return Err(error);
            }

            if attempt >= max_attempts {
                error!(operation = %self.name, attempts = max_attempts, error = %error, "giving up after final attempt");
                return Err(error);
            }

            if let Some(callback) = &self.on_retry {
                if let Err(callback_error) = callback(attempt, &error) {
                    warn!(operation = %self.name, error = %callback_error, "retry callback failed");
                }
            }

            let delay = self.backoff(attempt);
            warn!(
                operation = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            self.pause(delay).await?;
            attempt += 1;
        }
    }
}

/// 使用给定策略执行重试
pub async fn retry_with_policy<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    Retrier::new(policy.clone()).run(operation).await
}
