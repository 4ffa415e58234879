// Aggregates the captcha data types, the solving pipeline, and the retry loop used to pass the registry's click-word gate.

pub mod core;
pub mod pipeline;
pub mod solvers;
