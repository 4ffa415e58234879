//! High level query orchestration.
//!
//! Wires together the session client, the captcha solver and the retry loop
//! to expose a single call that looks up registry records by keyword.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use crate::challenges::core::{ApiTransport, ReqwestTransport, RetryPolicy, TransportError};
use crate::challenges::pipeline::{
	CaptchaRetryOrchestrator, ProgressCallback, ResolveError,
};
use crate::challenges::solvers::{AssetError, ChallengeSolver, ClickCaptchaSolver, SolveError, SolverConfig};
use crate::modules::events::{EventDispatcher, EventHandler};
use crate::session::{
	DEFAULT_PAGE_SIZE, QueryResponse, SearchType, SessionClient, SessionConfig, SessionError,
};

/// Default location of `backgrounds/` and `models/siamese.onnx`.
pub const DEFAULT_ASSETS_DIR: &str = "assets";

/// Result alias used across the query layer.
pub type IcpQueryResult<T> = Result<T, IcpQueryError>;

/// High-level error surfaced to callers.
///
/// Captcha exhaustion, server rejections and network failures are kept
/// apart so each can be handled on its own.
#[derive(Debug, Error)]
pub enum IcpQueryError {
	#[error("network failure: {0}")]
	Transport(#[from] TransportError),
	#[error("service rejected the request ({code}): {message}")]
	Api { code: i64, message: String },
	#[error("could not pass the captcha after {attempts} attempts")]
	CaptchaExhausted { attempts: u32 },
	#[error("query cancelled")]
	Cancelled,
	#[error("solver assets unavailable: {0}")]
	Asset(#[from] AssetError),
	#[error("captcha solver failed: {0}")]
	Solver(SolveError),
	#[error("protocol error: {0}")]
	Protocol(String),
}

impl From<SessionError> for IcpQueryError {
	fn from(err: SessionError) -> Self {
		match err {
			SessionError::Transport(err) => IcpQueryError::Transport(err),
			SessionError::Api { code, message } => IcpQueryError::Api { code, message },
			other => IcpQueryError::Protocol(other.to_string()),
		}
	}
}

impl From<ResolveError> for IcpQueryError {
	fn from(err: ResolveError) -> Self {
		match err {
			ResolveError::Session(err) => err.into(),
			ResolveError::Exhausted { attempts } => IcpQueryError::CaptchaExhausted { attempts },
			ResolveError::Cancelled => IcpQueryError::Cancelled,
			ResolveError::Solver(err) => IcpQueryError::Solver(err),
			ResolveError::Worker(reason) => IcpQueryError::Protocol(reason),
		}
	}
}

/// Query configuration used by the builder.
#[derive(Debug, Clone)]
pub struct IcpQueryConfig {
	pub session: SessionConfig,
	pub retry: RetryPolicy,
	pub solver: SolverConfig,
	pub page_size: u32,
	pub assets_dir: PathBuf,
}

impl Default for IcpQueryConfig {
	fn default() -> Self {
		Self {
			session: SessionConfig::default(),
			retry: RetryPolicy::default(),
			solver: SolverConfig::default(),
			page_size: DEFAULT_PAGE_SIZE,
			assets_dir: PathBuf::from(DEFAULT_ASSETS_DIR),
		}
	}
}

/// Fluent builder for [`IcpQuery`].
pub struct IcpQueryBuilder {
	config: IcpQueryConfig,
	transport: Option<Arc<dyn ApiTransport>>,
	solver: Option<Arc<dyn ChallengeSolver>>,
	progress: Option<ProgressCallback>,
	cancellation: Option<watch::Receiver<bool>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl IcpQueryBuilder {
	pub fn new() -> Self {
		Self {
			config: IcpQueryConfig::default(),
			transport: None,
			solver: None,
			progress: None,
			cancellation: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: IcpQueryConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
		self.config.session.api_base = api_base.into();
		self
	}

	pub fn with_credentials(mut self, account: impl Into<String>, secret: impl Into<String>) -> Self {
		self.config.session.account = account.into();
		self.config.session.secret = secret.into();
		self
	}

	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.config.session.user_agent = user_agent.into();
		self
	}

	pub fn with_max_attempts(mut self, attempts: u32) -> Self {
		self.config.retry = self.config.retry.with_max_attempts(attempts);
		self
	}

	pub fn with_retry_delay_range(mut self, min: Duration, max: Duration) -> Self {
		self.config.retry = self.config.retry.with_delay_range(min, max);
		self
	}

	/// Ignored when a solver is supplied with [`IcpQueryBuilder::with_solver`].
	pub fn with_classification_threshold(mut self, threshold: f64) -> Self {
		self.config.solver.classification_threshold = threshold;
		self
	}

	/// Ignored when a solver is supplied with [`IcpQueryBuilder::with_solver`].
	pub fn with_match_threshold(mut self, threshold: f32) -> Self {
		self.config.solver.match_threshold = threshold;
		self
	}

	/// Ignored when a solver is supplied with [`IcpQueryBuilder::with_solver`].
	pub fn with_binarize_cutoff(mut self, cutoff: u8) -> Self {
		self.config.solver.binarize_cutoff = cutoff;
		self
	}

	pub fn with_page_size(mut self, page_size: u32) -> Self {
		self.config.page_size = page_size.max(1);
		self
	}

	/// Directory holding `backgrounds/` and `models/`; ignored when a solver
	/// is supplied.
	pub fn with_assets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.config.assets_dir = dir.into();
		self
	}

	pub fn with_transport(mut self, transport: Arc<dyn ApiTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn with_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
		self.solver = Some(solver);
		self
	}

	/// Called with the zero-based attempt index before every captcha fetch.
	pub fn with_progress<F>(mut self, callback: F) -> Self
	where
		F: Fn(u32) + Send + Sync + 'static,
	{
		self.progress = Some(Arc::new(callback));
		self
	}

	pub fn with_cancellation(mut self, signal: watch::Receiver<bool>) -> Self {
		self.cancellation = Some(signal);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	/// Fails with [`IcpQueryError::Asset`] when no solver is supplied and the
	/// assets directory cannot be loaded.
	pub fn build(self) -> IcpQueryResult<IcpQuery> {
		if self.solver.is_some() && self.config.solver != SolverConfig::default() {
			log::warn!("solver thresholds are ignored because a custom solver was supplied");
		}
		let transport: Arc<dyn ApiTransport> = match self.transport {
			Some(transport) => transport,
			None => Arc::new(ReqwestTransport::new()?),
		};
		let solver: Arc<dyn ChallengeSolver> = match self.solver {
			Some(solver) => solver,
			None => Arc::new(ClickCaptchaSolver::from_assets_dir(
				&self.config.assets_dir,
				self.config.solver,
			)?),
		};

		let mut events = EventDispatcher::with_logging();
		for handler in self.handlers {
			events.register_handler(handler);
		}
		let mut orchestrator =
			CaptchaRetryOrchestrator::new(solver, self.config.retry.clone()).with_events(events);
		if let Some(progress) = self.progress {
			orchestrator = orchestrator.with_progress(progress);
		}
		if let Some(signal) = self.cancellation {
			orchestrator = orchestrator.with_cancellation(signal);
		}

		Ok(IcpQuery {
			config: self.config,
			transport,
			orchestrator,
		})
	}
}

impl Default for IcpQueryBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Registry query client.
///
/// Cheap to share across tasks; every call runs in its own session with a
/// fresh client id.
pub struct IcpQuery {
	config: IcpQueryConfig,
	transport: Arc<dyn ApiTransport>,
	orchestrator: CaptchaRetryOrchestrator,
}

impl IcpQuery {
	/// Construct a client with default configuration and bundled assets.
	pub fn new() -> IcpQueryResult<Self> {
		IcpQueryBuilder::new().build()
	}

	/// Obtain a builder to customise the client.
	pub fn builder() -> IcpQueryBuilder {
		IcpQueryBuilder::new()
	}

	pub fn config(&self) -> &IcpQueryConfig {
		&self.config
	}

	/// First page of records matching `keyword`.
	pub async fn query(&self, keyword: &str, search_type: SearchType) -> IcpQueryResult<QueryResponse> {
		self.query_page(keyword, search_type, 0, self.config.page_size).await
	}

	pub async fn query_page(
		&self,
		keyword: &str,
		search_type: SearchType,
		page_num: u32,
		page_size: u32,
	) -> IcpQueryResult<QueryResponse> {
		let session = self.authorized_session().await?;
		Ok(session.query(keyword, search_type, page_num, page_size).await?)
	}

	/// Authenticates a fresh session and passes one captcha with it, so the
	/// caller can page through results without solving again.
	pub async fn authorized_session(&self) -> IcpQueryResult<SessionClient> {
		let mut session = SessionClient::new(Arc::clone(&self.transport), &self.config.session)?;
		session.authenticate().await?;
		let outcome = self.orchestrator.resolve(&mut session).await?;
		log::debug!(
			"session {} authorized after {} captcha attempts",
			session.client_id(),
			outcome.attempts
		);
		Ok(session)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::challenges::core::{CaptchaChallenge, PointSet};
	use crate::challenges::solvers::background::BackgroundCatalog;
	use crate::challenges::solvers::similarity::{PatchTensor, SimilarityScorer};

	struct NeverSolves;

	impl ChallengeSolver for NeverSolves {
		fn name(&self) -> &'static str {
			"never"
		}

		fn solve(&self, _challenge: &CaptchaChallenge) -> Result<PointSet, SolveError> {
			Err(SolveError::Classification)
		}
	}

	#[test]
	fn defaults_follow_protocol() {
		let config = IcpQueryConfig::default();
		assert_eq!(config.page_size, 20);
		assert_eq!(config.retry.max_attempts(), 10);
		assert_eq!(config.solver.classification_threshold, 2.0);
		assert_eq!(config.solver.match_threshold, 0.6);
		assert_eq!(config.session.account, "test");
	}

	#[test]
	fn builder_clamps_and_applies_knobs() {
		let query = IcpQuery::builder()
			.with_solver(Arc::new(NeverSolves))
			.with_max_attempts(0)
			.with_page_size(0)
			.with_match_threshold(0.75)
			.with_retry_delay_range(Duration::from_millis(10), Duration::from_millis(20))
			.build()
			.unwrap();
		assert_eq!(query.config().retry.max_attempts(), 1);
		assert_eq!(query.config().page_size, 1);
		assert_eq!(query.config().solver.match_threshold, 0.75);
	}

	#[test]
	fn supplied_solver_keeps_its_own_thresholds() {
		struct Neutral;

		impl SimilarityScorer for Neutral {
			fn score(&self, _: &PatchTensor, _: &PatchTensor) -> Result<f32, SolveError> {
				Ok(0.0)
			}
		}

		let solver = Arc::new(ClickCaptchaSolver::new(
			Arc::new(BackgroundCatalog::default()),
			Arc::new(Neutral),
			SolverConfig::default(),
		));
		let query = IcpQuery::builder()
			.with_solver(solver.clone())
			.with_match_threshold(0.9)
			.with_binarize_cutoff(40)
			.build()
			.unwrap();
		assert_eq!(query.config().solver.match_threshold, 0.9);
		assert_eq!(solver.config().match_threshold, 0.6);
		assert_eq!(solver.config().binarize_cutoff, 20);
	}

	#[test]
	fn missing_assets_fail_at_build_time() {
		let err = IcpQuery::builder()
			.with_assets_dir("/nonexistent/icpquery-assets")
			.build()
			.err();
		assert!(matches!(err, Some(IcpQueryError::Asset(AssetError::Image { .. }))));
	}

	#[test]
	fn session_errors_map_to_distinct_causes() {
		let api: IcpQueryError = SessionError::Api {
			code: 403,
			message: "denied".into(),
		}
		.into();
		assert!(matches!(api, IcpQueryError::Api { code: 403, .. }));

		let network: IcpQueryError =
			SessionError::Transport(TransportError::Transport("reset".into())).into();
		assert!(matches!(network, IcpQueryError::Transport(_)));

		let exhausted: IcpQueryError = ResolveError::Exhausted { attempts: 10 }.into();
		assert!(matches!(exhausted, IcpQueryError::CaptchaExhausted { attempts: 10 }));
	}
}
