//! 有界重启的任务监督。退避逐次翻倍，只重试调用方
//! 认定可重试的错误。

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::monitoring::events;

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub max_restarts: usize,
    pub initial_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

pub async fn supervise<T, E, F, Fut, P>(
    name: &str,
    config: SupervisorConfig,
    should_retry: P,
    mut task: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut backoff = config.initial_backoff;
    let mut attempt = 0usize;

    loop {
        match task().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_restarts || !should_retry(&err) {
                    return Err(err);
                }
                attempt = attempt.saturating_add(1);
                events::supervisor_restart(name, attempt, backoff);
                sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }
    }
}
