//! Event system for the captcha retry loop.
//!
//! Provides hooks for logging and custom reactions around challenge
//! attempts.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// A fresh challenge is about to be fetched.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub client_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub timestamp: DateTime<Utc>,
}

/// An attempt ended without a verified answer.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub client_id: String,
    pub attempt: u32,
    pub reason: String,
    pub retry_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PassedEvent {
    pub client_id: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// The loop stopped without a pass.
#[derive(Debug, Clone)]
pub struct AbortEvent {
    pub client_id: String,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CaptchaEvent {
    AttemptStarted(AttemptEvent),
    SolveFailed(FailureEvent),
    VerificationRejected(FailureEvent),
    Passed(PassedEvent),
    Exhausted(AbortEvent),
    Cancelled(AbortEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &CaptchaEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Dispatcher with a [`LoggingHandler`] already registered.
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: CaptchaEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &CaptchaEvent) {
        match event {
            CaptchaEvent::AttemptStarted(attempt) => {
                log::debug!(
                    "captcha {} attempt {}/{}",
                    attempt.client_id,
                    attempt.attempt + 1,
                    attempt.max_attempts
                );
            }
            CaptchaEvent::SolveFailed(failure) => {
                log::info!(
                    "captcha {} attempt {} not solved: {} (retry in {:.2}s)",
                    failure.client_id,
                    failure.attempt + 1,
                    failure.reason,
                    failure.retry_after.as_secs_f64()
                );
            }
            CaptchaEvent::VerificationRejected(failure) => {
                log::info!(
                    "captcha {} attempt {} rejected: {} (retry in {:.2}s)",
                    failure.client_id,
                    failure.attempt + 1,
                    failure.reason,
                    failure.retry_after.as_secs_f64()
                );
            }
            CaptchaEvent::Passed(passed) => {
                log::info!(
                    "captcha {} passed on attempt {}",
                    passed.client_id,
                    passed.attempt + 1
                );
            }
            CaptchaEvent::Exhausted(abort) => {
                log::warn!(
                    "captcha {} not passed after {} attempts",
                    abort.client_id,
                    abort.attempts
                );
            }
            CaptchaEvent::Cancelled(abort) => {
                log::warn!(
                    "captcha {} cancelled after {} attempts",
                    abort.client_id,
                    abort.attempts
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &CaptchaEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::with_logging();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        assert_eq!(dispatcher.len(), 2);
        dispatcher.dispatch(CaptchaEvent::Passed(PassedEvent {
            client_id: "c0ffee".into(),
            attempt: 0,
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }
}
