//! Execution session: the live connections one logical task runs against.
//!
//! A [`Session`] is cheap to clone. Clones share one set of backends, so a
//! session bound to another task via [`Session::with_task`] keeps using the
//! same connections. Nothing is global: every operator invocation and every
//! worker step receives the session explicitly.

use std::future::Future;
use std::sync::{Arc, RwLock};

use coper_coord::CoordinationStore;
use coper_core::Config;
use coper_queue::{Broker, MemoryQueue};
use coper_storage::BlobStore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RuntimeError, SessionError};

/// Connections to the three shared stores.
#[derive(Clone)]
pub struct Backends {
    pub coord: Arc<dyn CoordinationStore>,
    pub broker: Arc<dyn Broker>,
    pub blobs: Arc<BlobStore>,
}

impl Backends {
    /// Connect every backend selected by config.
    pub async fn connect(config: &Config) -> Result<Self, RuntimeError> {
        let coord = coper_coord::connect(config).await?;
        let broker = coper_queue::connect(config).await?;
        let blobs = Arc::new(BlobStore::from_config(config)?);
        Ok(Self { coord, broker, blobs })
    }

    /// Fresh in-process backends with nothing shared outside this value.
    pub fn in_memory() -> Self {
        Self {
            coord: Arc::new(coper_coord::MemoryStore::new()),
            broker: Arc::new(MemoryQueue::new(coper_core::config::DEFAULT_QUEUE_NAME)),
            blobs: Arc::new(BlobStore::in_memory()),
        }
    }
}

struct Shared {
    config: Option<Config>,
    backends: RwLock<Option<Backends>>,
}

#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    task: Option<Arc<str>>,
}

impl Session {
    /// A session that connects from `config` when entered.
    pub fn new(config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Some(config),
                backends: RwLock::new(None),
            }),
            task: None,
        }
    }

    /// An already-entered session over existing backends.
    pub fn with_backends(backends: Backends) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: None,
                backends: RwLock::new(Some(backends)),
            }),
            task: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::with_backends(Backends::in_memory())
    }

    /// Open the connections. Fails if the session is already entered.
    pub async fn enter(&self) -> Result<(), RuntimeError> {
        if self.is_entered() {
            return Err(SessionError::AlreadyEntered.into());
        }
        let config = self
            .shared
            .config
            .as_ref()
            .ok_or_else(|| RuntimeError::InvalidArgument("session was built without a config to connect from".into()))?;
        let backends = Backends::connect(config).await?;
        let mut slot = self.shared.backends.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(SessionError::AlreadyEntered.into());
        }
        *slot = Some(backends);
        info!(profile = config.profile_label(), "session entered");
        Ok(())
    }

    /// Release the broker connection. The coordination store client is
    /// pooled and simply dropped.
    pub async fn exit(&self) -> Result<(), RuntimeError> {
        let backends = self
            .shared
            .backends
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match backends {
            Some(backends) => {
                backends.broker.close().await?;
                debug!("session exited");
                Ok(())
            }
            None => {
                warn!("exit called on a session that was not entered");
                Ok(())
            }
        }
    }

    /// Run `body` inside an entered session and exit afterwards, even when
    /// `body` fails.
    pub async fn scope<T, F, Fut>(&self, body: F) -> Result<T, RuntimeError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T, RuntimeError>>,
    {
        self.enter().await?;
        let outcome = body(self.clone()).await;
        let closed = self.exit().await;
        let value = outcome?;
        closed?;
        Ok(value)
    }

    pub fn is_entered(&self) -> bool {
        self.shared
            .backends
            .read()
            .map(|b| b.is_some())
            .unwrap_or(false)
    }

    /// A clone bound to `task`, sharing this session's connections.
    pub fn with_task(&self, task: impl Into<String>) -> Session {
        Session {
            shared: self.shared.clone(),
            task: Some(Arc::from(task.into())),
        }
    }

    /// A clone bound to a freshly generated task id.
    pub fn with_new_task(&self) -> Session {
        self.with_task(Uuid::new_v4().to_string())
    }

    pub fn task(&self) -> Result<&str, SessionError> {
        self.task.as_deref().ok_or(SessionError::NoTask)
    }

    fn backends(&self, what: &'static str) -> Result<Backends, SessionError> {
        self.shared
            .backends
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SessionError::NotEntered(what))
    }

    pub fn coord(&self) -> Result<Arc<dyn CoordinationStore>, SessionError> {
        Ok(self.backends("coordination store")?.coord)
    }

    pub fn broker(&self) -> Result<Arc<dyn Broker>, SessionError> {
        Ok(self.backends("broker")?.broker)
    }

    pub fn blobs(&self) -> Result<Arc<BlobStore>, SessionError> {
        Ok(self.backends("object store")?.blobs)
    }

    /// Delete every coordination-store key of the bound task.
    pub async fn purge_task(&self) -> Result<u64, RuntimeError> {
        let task = self.task()?;
        let removed = self.coord()?.purge_task(task).await?;
        info!(task, removed, "task purged");
        Ok(removed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("task", &self.task)
            .field("entered", &self.is_entered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backends_unavailable_before_enter() {
        let session = Session::new(Config::in_memory());
        assert!(!session.is_entered());
        assert_eq!(
            session.coord().err(),
            Some(SessionError::NotEntered("coordination store"))
        );
        assert!(matches!(session.broker(), Err(SessionError::NotEntered(_))));
        assert!(matches!(session.blobs(), Err(SessionError::NotEntered(_))));
    }

    #[test]
    fn task_must_be_bound() {
        let session = Session::in_memory();
        assert_eq!(session.task().err(), Some(SessionError::NoTask));
        let bound = session.with_task("t-1");
        assert_eq!(bound.task().unwrap(), "t-1");
        assert_ne!(session.with_new_task().task().unwrap(), session.with_new_task().task().unwrap());
    }

    #[tokio::test]
    async fn enter_and_exit_cycle() {
        let session = Session::new(Config::in_memory());
        session.enter().await.unwrap();
        assert!(session.is_entered());
        assert!(matches!(
            session.enter().await,
            Err(RuntimeError::Session(SessionError::AlreadyEntered))
        ));

        let bound = session.with_task("shared");
        assert!(bound.coord().is_ok());

        session.exit().await.unwrap();
        assert!(!bound.is_entered());
        assert!(bound.coord().is_err());
    }

    #[tokio::test]
    async fn scope_exits_after_failure() {
        let session = Session::new(Config::in_memory());
        let result: Result<(), _> = session
            .scope(|s| async move {
                assert!(s.is_entered());
                Err(RuntimeError::InvalidArgument("inside".into()))
            })
            .await;
        assert!(matches!(result, Err(RuntimeError::InvalidArgument(_))));
        assert!(!session.is_entered());
    }

    #[tokio::test]
    async fn exit_closes_the_broker() {
        let session = Session::in_memory();
        let broker = session.broker().unwrap();
        session.exit().await.unwrap();
        assert!(broker.publish(b"late").await.is_err());
    }
}
