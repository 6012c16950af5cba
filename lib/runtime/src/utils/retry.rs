// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Declarative retry.
//!
//! A [`RetryPolicy`] describes how many attempts an operation gets and how long to wait before
//! each one. [`retry_blocking`] and [`retry_async`] apply a policy to a fallible closure. The
//! caller decides which errors are worth another attempt; anything else ends the loop at once.

use std::time::Duration;

/// Wait before attempt `n` (1-based) is `(n - 1) * step`, so a three-attempt linear policy
/// with a 100 ms step waits 0, 100 and 200 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Linear(Duration),
    Fixed(Duration),
}

impl Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear(step) => *step * attempt.saturating_sub(1),
            Backoff::Fixed(d) if attempt > 1 => *d,
            Backoff::Fixed(_) => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear(step),
        }
    }

    /// Single attempt, no waiting
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    /// Policy for local memory access: 3 attempts spaced 0, 100 and 200 ms
    pub const fn local_memory() -> Self {
        Self::linear(3, Duration::from_millis(100))
    }

    /// Wait before the given 1-based attempt
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::local_memory()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("operation failed on attempt {attempt} with a non-retryable error: {error}")]
    Permanent { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    /// The error returned by the final attempt
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Permanent { attempt, .. } => *attempt,
        }
    }
}

/// Run `op` on the current thread until it succeeds, fails with an error `retryable` rejects,
/// or the policy runs out of attempts. `op` receives the 1-based attempt number.
pub fn retry_blocking<T, E, F, R>(
    policy: &RetryPolicy,
    retryable: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Result<T, E>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(error) if !retryable(&error) => {
                return Err(RetryError::Permanent { attempt, error });
            }
            Err(error) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }
            Err(error) => {
                tracing::debug!(attempt, max_attempts, %error, "attempt failed, retrying");
            }
        }
        attempt += 1;
    }
}

/// Async counterpart of [`retry_blocking`]; waits with `tokio::time::sleep`.
pub async fn retry_async<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    retryable: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if !retryable(&error) => {
                return Err(RetryError::Permanent { attempt, error });
            }
            Err(error) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }
            Err(error) => {
                tracing::debug!(attempt, max_attempts, %error, "attempt failed, retrying");
            }
        }
        attempt += 1;
    }
}
