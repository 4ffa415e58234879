//! Cross-cutting services module.
//!
//! Hooks that observe the captcha loop without taking part in it.

pub mod events;

pub use events::{
    AbortEvent, AttemptEvent, CaptchaEvent, EventDispatcher, EventHandler, FailureEvent,
    LoggingHandler, PassedEvent,
};
