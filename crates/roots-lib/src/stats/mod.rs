//! Statistical engine: a bounded pool of exclusively borrowed sessions
//!
//! A session holds a growable data frame and performs the two numeric capabilities
//! the diagnosis pipeline needs:
//! - relative importance of each regressor (LMG decomposition of R²)
//! - change point search over a numeric series (PELT or binary segmentation)
//!
//! Sessions are borrowed through [`StatsEngine::borrow`], which waits at most the
//! configured timeout. The returned [`SessionGuard`] resets the session and hands it
//! back to the pool when dropped, on every exit path. A guard marked broken discards
//! its session instead; the pool creates a fresh one on a later borrow.

pub mod local;
pub mod regression;
pub mod segmentation;

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::changepoint::ChangePointMethod;
use crate::error::StatsError;
use crate::observability::RootsMetrics;

pub use local::LocalSession;
pub use regression::{ImportanceDecomposition, MAX_PREDICTORS};

/// Default number of pooled sessions
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default wait for a free session
pub const DEFAULT_BORROW_TIMEOUT: Duration = Duration::from_secs(30);

/// A statistics session with its own data frame
#[async_trait]
pub trait StatsSession: Send + 'static {
    /// Clear the frame and any intermediate state
    fn reset(&mut self);

    /// Append one row; every row must have the same width
    fn append_row(&mut self, row: &[f64]) -> Result<(), StatsError>;

    fn row_count(&self) -> usize;

    /// Regress the last column on all preceding columns and decompose R²
    async fn relative_importance(&mut self) -> Result<ImportanceDecomposition, StatsError>;

    /// Start positions of every segment after the first
    async fn change_points(
        &mut self,
        series: &[f64],
        method: ChangePointMethod,
    ) -> Result<Vec<usize>, StatsError>;
}

/// Creates sessions on demand
pub type SessionFactory = Box<dyn Fn() -> Box<dyn StatsSession> + Send + Sync>;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct StatsEngineConfig {
    pub pool_size: usize,
    pub borrow_timeout: Duration,
}

impl Default for StatsEngineConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            borrow_timeout: DEFAULT_BORROW_TIMEOUT,
        }
    }
}

/// Bounded pool of statistics sessions
pub struct StatsEngine {
    idle: Mutex<Vec<Box<dyn StatsSession>>>,
    permits: Arc<Semaphore>,
    factory: SessionFactory,
    config: StatsEngineConfig,
    metrics: RootsMetrics,
}

impl std::fmt::Debug for StatsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsEngine")
            .field("config", &self.config)
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

impl StatsEngine {
    /// Pool of in-process sessions
    pub fn local(config: StatsEngineConfig) -> Self {
        Self::with_factory(
            config,
            Box::new(|| -> Box<dyn StatsSession> { Box::new(LocalSession::new()) }),
        )
    }

    pub fn with_factory(config: StatsEngineConfig, factory: SessionFactory) -> Self {
        let pool_size = config.pool_size.max(1);
        Self {
            idle: Mutex::new(Vec::with_capacity(pool_size)),
            permits: Arc::new(Semaphore::new(pool_size)),
            factory,
            config,
            metrics: RootsMetrics::new(),
        }
    }

    /// Borrow a session, waiting up to the configured timeout
    pub async fn borrow(&self) -> Result<SessionGuard<'_>, StatsError> {
        let permit = tokio::time::timeout(
            self.config.borrow_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| StatsError::PoolExhausted(self.config.borrow_timeout))?
        .map_err(|_| StatsError::SessionFailed("statistics engine is closed".to_string()))?;

        let session = self.lock_idle().pop().unwrap_or_else(|| {
            debug!("Creating new statistics session");
            (self.factory)()
        });
        self.metrics.inc_sessions_in_use();

        Ok(SessionGuard {
            session: Some(session),
            engine: self,
            broken: false,
            _permit: permit,
        })
    }

    /// Sessions that can be borrowed without waiting
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn idle_sessions(&self) -> usize {
        self.lock_idle().len()
    }

    /// Reject further borrows and drop idle sessions
    pub fn close(&self) {
        self.permits.close();
        self.lock_idle().clear();
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn StatsSession>>> {
        // A panic while holding the lock cannot leave the Vec itself inconsistent
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, mut session: Box<dyn StatsSession>, broken: bool) {
        self.metrics.dec_sessions_in_use();
        if broken {
            warn!("Discarding broken statistics session");
            return;
        }
        session.reset();
        if !self.permits.is_closed() {
            self.lock_idle().push(session);
        }
    }
}

/// Exclusive access to one pooled session
pub struct SessionGuard<'a> {
    session: Option<Box<dyn StatsSession>>,
    engine: &'a StatsEngine,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl SessionGuard<'_> {
    /// Discard the session on release instead of returning it to the pool
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for SessionGuard<'_> {
    type Target = dyn StatsSession;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_deref()
            .unwrap_or_else(|| unreachable!("session is only taken on drop"))
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("session is only taken on drop"))
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.engine.release(session, self.broken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine(pool_size: usize, timeout_ms: u64) -> StatsEngine {
        StatsEngine::local(StatsEngineConfig {
            pool_size,
            borrow_timeout: Duration::from_millis(timeout_ms),
        })
    }

    #[tokio::test]
    async fn test_borrow_and_release_resets_session() {
        let engine = engine(1, 100);
        {
            let mut session = engine.borrow().await.unwrap();
            session.append_row(&[1.0, 2.0]).unwrap();
            assert_eq!(session.row_count(), 1);
            assert_eq!(engine.available(), 0);
        }
        assert_eq!(engine.available(), 1);
        assert_eq!(engine.idle_sessions(), 1);

        let session = engine.borrow().await.unwrap();
        assert_eq!(session.row_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_borrow_times_out_when_exhausted() {
        let engine = engine(1, 50);
        let _held = engine.borrow().await.unwrap();

        let result = engine.borrow().await;
        assert!(matches!(result, Err(StatsError::PoolExhausted(_))));
    }

    #[tokio::test]
    async fn test_released_on_error_path() {
        async fn failing(engine: &StatsEngine) -> Result<(), StatsError> {
            let mut session = engine.borrow().await?;
            session.append_row(&[1.0])?;
            session.append_row(&[1.0, 2.0])?;
            Ok(())
        }

        let engine = engine(1, 50);
        assert!(failing(&engine).await.is_err());
        assert_eq!(engine.available(), 1);
        assert!(engine.borrow().await.is_ok());
    }

    #[tokio::test]
    async fn test_broken_session_is_replaced() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let engine = StatsEngine::with_factory(
            StatsEngineConfig {
                pool_size: 1,
                borrow_timeout: Duration::from_millis(50),
            },
            Box::new(move || -> Box<dyn StatsSession> {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(LocalSession::new())
            }),
        );

        {
            let mut session = engine.borrow().await.unwrap();
            session.mark_broken();
        }
        assert_eq!(engine.idle_sessions(), 0);
        assert_eq!(engine.available(), 1);

        let _session = engine.borrow().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_engine_rejects_borrow() {
        let engine = engine(2, 50);
        engine.close();
        assert!(matches!(
            engine.borrow().await,
            Err(StatsError::SessionFailed(_))
        ));
    }
}
