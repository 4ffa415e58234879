//! Core utilities shared by the solver, the session client, and the retry loop.

pub mod answer;
pub mod reqwest_client;
pub mod timing;
pub mod transport;
pub mod types;

pub use answer::{AnswerError, decode_answer, encode_answer};
pub use reqwest_client::ReqwestTransport;
pub use timing::RetryPolicy;
pub use transport::{ApiTransport, TransportError, TransportResponse, header_value};
pub use types::{
    Authorization, CLICK_COUNT, CandidatePoint, CaptchaChallenge, DetectedRegion, PointSet,
    Session,
};
