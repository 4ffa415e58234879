//! # icpquery-rs
//!
//! Async client for the ICP filing registry that passes the click-word
//! image captcha on its own.
//!
//! Every lookup authenticates a short-lived session, fetches a captcha,
//! solves it locally (background subtraction, contour extraction and a
//! Siamese similarity model), submits the encrypted answer, and finally
//! queries the registry with the signed capability it gets back.
//!
//! ## Features
//!
//! - Async HTTP client with cookie persistence
//! - Offline click-word captcha solver (no third-party solving service)
//! - Bounded retries with jittered delay, progress callback and cancellation
//! - Typed site and app filing records
//!
//! ## Example
//!
//! ```no_run
//! use icpquery_rs::{IcpQuery, SearchType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = IcpQuery::builder().with_assets_dir("assets").build()?;
//!     let response = client.query("example.cn", SearchType::Domain).await?;
//!     for record in &response {
//!         println!("{} {}", record.unit_name(), record.service_licence());
//!     }
//!     Ok(())
//! }
//! ```

mod icpquery;

pub mod challenges;
pub mod modules;
pub mod session;

pub use crate::icpquery::{
    DEFAULT_ASSETS_DIR,
    IcpQuery,
    IcpQueryBuilder,
    IcpQueryConfig,
    IcpQueryError,
    IcpQueryResult,
};

pub use crate::challenges::core::{
    AnswerError,
    ApiTransport,
    Authorization,
    CandidatePoint,
    CaptchaChallenge,
    DetectedRegion,
    PointSet,
    ReqwestTransport,
    RetryPolicy,
    Session,
    TransportError,
    TransportResponse,
    decode_answer,
    encode_answer,
};

pub use crate::challenges::pipeline::{
    CaptchaRetryOrchestrator,
    ChallengeGateway,
    ProgressCallback,
    ResolveError,
    ResolveOutcome,
    ResolveState,
};

pub use crate::challenges::solvers::{
    AssetError,
    ChallengeSolver,
    ClickCaptchaSolver,
    SolveError,
    SolveReport,
    SolverConfig,
    background::{BackgroundCatalog, BackgroundKind, ReferenceBackground},
    similarity::{PatchTensor, SiameseScorer, SimilarityScorer},
};

pub use crate::session::{
    AppRecord,
    QueryRecord,
    QueryResponse,
    SearchType,
    SessionClient,
    SessionConfig,
    SessionError,
    SiteRecord,
};

pub use crate::modules::{
    CaptchaEvent,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
