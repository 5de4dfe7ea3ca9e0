//! NodeRegistry
//!
//! Per name the slot moves `absent -> creating -> active -> closing -> absent`.
//! Creation runs in its own task so a cancelled caller cannot strand the
//! slot; every concurrent acquirer awaits the same shared result.

use crate::error::RegistryError;
use crate::node::NodeHandle;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tailnode_auth::CredentialProvisioner;
use tailnode_config::{create_state_dir, AppConfig, ConfigResolver, EnvSource};
use tailnode_proto::RuntimeFactory;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

type CreateFuture = Shared<BoxFuture<'static, Result<Arc<NodeHandle>, RegistryError>>>;
type CloseFuture = Shared<BoxFuture<'static, Result<(), RegistryError>>>;

enum Slot {
    Creating {
        generation: u64,
        refs: usize,
        ready: CreateFuture,
    },
    Active {
        generation: u64,
        refs: usize,
        node: Arc<NodeHandle>,
    },
    Closing {
        done: CloseFuture,
    },
}

/// Result of [`NodeRegistry::release`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other holders remain
    Released { remaining: usize },
    /// That was the last reference; the node has been shut down
    ShutDown,
    /// No active node under that name
    NotFound,
}

struct Inner {
    slots: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
    config: Arc<AppConfig>,
    env: Arc<dyn EnvSource>,
    provisioner: CredentialProvisioner,
    factory: Arc<dyn RuntimeFactory>,
}

/// Shared, reference-counted set of running nodes
#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<Inner>,
}

impl NodeRegistry {
    pub fn new(
        config: Arc<AppConfig>,
        env: Arc<dyn EnvSource>,
        factory: Arc<dyn RuntimeFactory>,
    ) -> Self {
        let provisioner = CredentialProvisioner::new(Arc::clone(&env));
        Self::with_provisioner(config, env, factory, provisioner)
    }

    pub fn with_provisioner(
        config: Arc<AppConfig>,
        env: Arc<dyn EnvSource>,
        factory: Arc<dyn RuntimeFactory>,
        provisioner: CredentialProvisioner,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                config,
                env,
                provisioner,
                factory,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Get the node called `name`, starting it if nobody holds it yet.
    ///
    /// Each successful call takes one reference that must be given back with
    /// [`release`](Self::release). Concurrent callers for the same name share
    /// one creation attempt and all see its outcome; a failed attempt leaves
    /// nothing behind, so the next call tries again.
    pub async fn acquire(&self, name: &str) -> Result<Arc<NodeHandle>, RegistryError> {
        loop {
            let wait = {
                let mut slots = self.inner.slots();
                match slots.get_mut(name) {
                    Some(Slot::Active { refs, node, .. }) => {
                        *refs += 1;
                        debug!(node = %name, refs = *refs, "Reusing running node");
                        return Ok(Arc::clone(node));
                    }
                    Some(Slot::Creating {
                        generation,
                        refs,
                        ready,
                    }) => {
                        *refs += 1;
                        debug!(node = %name, "Waiting for node creation in progress");
                        Wait::Ready(*generation, ready.clone())
                    }
                    Some(Slot::Closing { done }) => Wait::Closing(done.clone()),
                    None => {
                        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                        let ready = self.inner.spawn_create(name, generation);
                        slots.insert(
                            name.to_string(),
                            Slot::Creating {
                                generation,
                                refs: 1,
                                ready: ready.clone(),
                            },
                        );
                        Wait::Ready(generation, ready)
                    }
                }
            };

            match wait {
                Wait::Closing(done) => {
                    debug!(node = %name, "Waiting for node shutdown before restarting");
                    let _ = done.await;
                }
                Wait::Ready(generation, ready) => {
                    let mut waiter = Waiter {
                        inner: &self.inner,
                        name,
                        generation,
                        armed: true,
                    };
                    let result = ready.await;
                    waiter.armed = false;
                    return result;
                }
            }
        }
    }

    /// Give back one reference taken by [`acquire`](Self::acquire).
    ///
    /// The last release shuts the node down and waits for the shutdown to
    /// finish. Releasing a name that is not active is a no-op.
    pub async fn release(&self, name: &str) -> Result<ReleaseOutcome, RegistryError> {
        match self.inner.release_ref(name) {
            Released::Missing => {
                warn!(node = %name, "Release of a node that is not active");
                Ok(ReleaseOutcome::NotFound)
            }
            Released::Remaining(remaining) => {
                debug!(node = %name, refs = remaining, "Released node reference");
                Ok(ReleaseOutcome::Released { remaining })
            }
            Released::Closing(done) => {
                done.await?;
                Ok(ReleaseOutcome::ShutDown)
            }
        }
    }

    /// Give back a reference without waiting for the shutdown it may start.
    ///
    /// Outside a runtime that shutdown runs when the next acquirer of `name`
    /// waits for it.
    pub(crate) fn release_detached(&self, name: &str) {
        match self.inner.release_ref(name) {
            Released::Missing => warn!(node = %name, "Release of a node that is not active"),
            Released::Remaining(remaining) => {
                debug!(node = %name, refs = remaining, "Released node reference")
            }
            Released::Closing(_) => {}
        }
    }

    /// The active node called `name`, without taking a reference
    pub fn lookup(&self, name: &str) -> Option<Arc<NodeHandle>> {
        match self.inner.slots().get(name) {
            Some(Slot::Active { node, .. }) => Some(Arc::clone(node)),
            _ => None,
        }
    }

    /// Current reference count for `name` (pending acquirers included)
    pub fn references(&self, name: &str) -> usize {
        match self.inner.slots().get(name) {
            Some(Slot::Active { refs, .. }) | Some(Slot::Creating { refs, .. }) => *refs,
            _ => 0,
        }
    }

    /// Snapshot of every active node
    pub fn active_nodes(&self) -> Vec<Arc<NodeHandle>> {
        self.inner
            .slots()
            .values()
            .filter_map(|slot| match slot {
                Slot::Active { node, .. } => Some(Arc::clone(node)),
                _ => None,
            })
            .collect()
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.inner.slots();
        f.debug_struct("NodeRegistry")
            .field("nodes", &slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

enum Wait {
    Ready(u64, CreateFuture),
    Closing(CloseFuture),
}

enum Released {
    Missing,
    Remaining(usize),
    Closing(CloseFuture),
}

/// Returns the reference of an acquirer that stops waiting early
struct Waiter<'a> {
    inner: &'a Arc<Inner>,
    name: &'a str,
    generation: u64,
    armed: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let completed = {
            let mut slots = self.inner.slots();
            match slots.get_mut(self.name) {
                Some(Slot::Creating {
                    generation, refs, ..
                }) if *generation == self.generation => {
                    *refs = refs.saturating_sub(1);
                    debug!(node = %self.name, refs = *refs, "Acquirer cancelled during node creation");
                    false
                }
                Some(Slot::Active { generation, .. }) => *generation == self.generation,
                _ => false,
            }
        };

        // Creation finished and counted this acquirer before it could return
        if completed {
            let _ = self.inner.release_ref(self.name);
        }
    }
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_create(self: &Arc<Self>, name: &str, generation: u64) -> CreateFuture {
        let inner = Arc::clone(self);
        let task_name = name.to_string();
        let task = tokio::spawn(async move {
            let result = inner.create(&task_name).await;
            inner.finish_create(&task_name, generation, result)
        });

        let inner = Arc::clone(self);
        let name = name.to_string();
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(node = %name, "Node creation task failed: {}", e);
                    let mut slots = inner.slots();
                    if matches!(slots.get(&name), Some(Slot::Creating { generation: g, .. }) if *g == generation)
                    {
                        slots.remove(&name);
                    }
                    Err(RegistryError::Aborted {
                        name,
                        message: e.to_string(),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Resolve settings, provision the credential and start the runtime
    async fn create(&self, name: &str) -> Result<Arc<NodeHandle>, RegistryError> {
        let resolver = ConfigResolver::new(&self.config, self.env.as_ref());
        let mut options = resolver.resolve(name)?;

        create_state_dir(&options.state_dir).map_err(|e| RegistryError::StateDir {
            name: name.to_string(),
            path: options.state_dir.display().to_string(),
            message: e.to_string(),
        })?;

        options.auth_key = self
            .provisioner
            .provision(&options)
            .await
            .map_err(|source| RegistryError::Credential {
                name: name.to_string(),
                source,
            })?;

        let hostname = options.hostname.clone();
        info!(node = %name, hostname = %hostname, "Starting node");

        let runtime = self
            .factory
            .start(options)
            .await
            .map_err(|e| RegistryError::Start {
                name: name.to_string(),
                source: Arc::new(e),
            })?;

        info!(node = %name, hostname = %hostname, "Node started");
        Ok(Arc::new(NodeHandle::new(
            name.to_string(),
            hostname,
            runtime,
        )))
    }

    fn finish_create(
        self: &Arc<Self>,
        name: &str,
        generation: u64,
        result: Result<Arc<NodeHandle>, RegistryError>,
    ) -> Result<Arc<NodeHandle>, RegistryError> {
        let mut slots = self.slots();

        let refs = match slots.get(name) {
            Some(Slot::Creating {
                generation: g,
                refs,
                ..
            }) if *g == generation => *refs,
            _ => 0,
        };

        match result {
            Err(e) => {
                error!(node = %name, "Failed to create node: {}", e);
                slots.remove(name);
                Err(e)
            }
            Ok(node) if refs == 0 => {
                warn!(node = %name, "Every acquirer gave up during creation, shutting node down");
                let done = self.begin_close(name, node);
                slots.insert(name.to_string(), Slot::Closing { done });
                Err(RegistryError::Aborted {
                    name: name.to_string(),
                    message: "all acquirers cancelled".to_string(),
                })
            }
            Ok(node) => {
                slots.insert(
                    name.to_string(),
                    Slot::Active {
                        generation,
                        refs,
                        node: Arc::clone(&node),
                    },
                );
                Ok(node)
            }
        }
    }

    fn release_ref(self: &Arc<Self>, name: &str) -> Released {
        let mut slots = self.slots();
        let Some(Slot::Active { refs, node, .. }) = slots.get_mut(name) else {
            return Released::Missing;
        };

        *refs -= 1;
        if *refs > 0 {
            return Released::Remaining(*refs);
        }

        let node = Arc::clone(node);
        info!(node = %name, "Last reference released, shutting node down");
        let done = self.begin_close(name, node);
        slots.insert(name.to_string(), Slot::Closing { done: done.clone() });
        Released::Closing(done)
    }

    /// Shut `node` down in the background; the slot is removed once done.
    fn begin_close(self: &Arc<Self>, name: &str, node: Arc<NodeHandle>) -> CloseFuture {
        let inner = Arc::clone(self);
        let name = name.to_string();
        let task_name = name.clone();
        let shutdown = async move {
            let name = task_name;
            let result = node.runtime().shutdown().await;

            let mut slots = inner.slots();
            if matches!(slots.get(&name), Some(Slot::Closing { .. })) {
                slots.remove(&name);
            }
            drop(slots);

            match result {
                Ok(()) => {
                    info!(node = %name, "Node shut down");
                    Ok(())
                }
                Err(e) => {
                    error!(node = %name, "Node shutdown failed: {}", e);
                    Err(RegistryError::Shutdown {
                        name,
                        source: Arc::new(e),
                    })
                }
            }
        };

        match Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(shutdown);
                async move {
                    task.await.unwrap_or_else(|e| {
                        Err(RegistryError::Aborted {
                            name,
                            message: e.to_string(),
                        })
                    })
                }
                .boxed()
                .shared()
            }
            // Outside a runtime the shutdown runs when first awaited
            Err(_) => shutdown.boxed().shared(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFactory;
    use std::time::Duration;
    use tailnode_config::MapEnv;

    fn registry(factory: &Arc<FakeFactory>, dir: &std::path::Path) -> NodeRegistry {
        let config = AppConfig {
            state_dir: dir.display().to_string(),
            ..Default::default()
        };
        NodeRegistry::new(
            Arc::new(config),
            Arc::new(MapEnv::new()),
            Arc::clone(factory) as Arc<dyn RuntimeFactory>,
        )
    }

    #[tokio::test]
    async fn test_acquire_reuses_running_node() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new());
        let registry = registry(&factory, dir.path());

        let a = registry.acquire("web").await.unwrap();
        let b = registry.acquire("web").await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.starts(), 1);
        assert_eq!(registry.references("web"), 2);
        assert!(dir.path().join("web").is_dir());
    }

    #[tokio::test]
    async fn test_release_counts_down_then_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new());
        let registry = registry(&factory, dir.path());

        registry.acquire("web").await.unwrap();
        registry.acquire("web").await.unwrap();

        assert_eq!(
            registry.release("web").await.unwrap(),
            ReleaseOutcome::Released { remaining: 1 }
        );
        assert_eq!(factory.shutdowns(), 0);
        assert!(registry.lookup("web").is_some());

        assert_eq!(
            registry.release("web").await.unwrap(),
            ReleaseOutcome::ShutDown
        );
        assert_eq!(factory.shutdowns(), 1);
        assert!(registry.lookup("web").is_none());
        assert_eq!(registry.references("web"), 0);
    }

    #[tokio::test]
    async fn test_release_unknown_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new());
        let registry = registry(&factory, dir.path());

        assert_eq!(
            registry.release("ghost").await.unwrap(),
            ReleaseOutcome::NotFound
        );

        registry.acquire("web").await.unwrap();
        registry.release("web").await.unwrap();
        assert_eq!(
            registry.release("web").await.unwrap(),
            ReleaseOutcome::NotFound
        );
        assert_eq!(factory.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new());
        let registry = registry(&factory, dir.path());

        let first = registry.acquire("web").await.unwrap();
        registry.release("web").await.unwrap();
        let second = registry.acquire("web").await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.starts(), 2);
    }

    #[tokio::test]
    async fn test_failed_start_leaves_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new());
        factory.fail_next_start("boom");
        let registry = registry(&factory, dir.path());

        let err = registry.acquire("web").await.unwrap_err();
        assert!(matches!(err, RegistryError::Start { .. }));
        assert!(registry.lookup("web").is_none());
        assert_eq!(registry.references("web"), 0);

        registry.acquire("web").await.unwrap();
        assert_eq!(factory.starts(), 2);
    }

    #[tokio::test]
    async fn test_config_error_aborts_start() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new());
        let config = AppConfig {
            state_dir: dir.path().display().to_string(),
            control_url: "{env.UNSET_CONTROL}".to_string(),
            ..Default::default()
        };
        let registry = NodeRegistry::new(
            Arc::new(config),
            Arc::new(MapEnv::new()),
            Arc::clone(&factory) as Arc<dyn RuntimeFactory>,
        );

        let err = registry.acquire("web").await.unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)));
        assert_eq!(factory.starts(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_sole_acquirer_shuts_node_down() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::gated());
        let registry = registry(&factory, dir.path());

        let pending = tokio::time::timeout(Duration::from_millis(50), registry.acquire("web")).await;
        assert!(pending.is_err());
        assert_eq!(registry.references("web"), 0);

        factory.open_gate();
        for _ in 0..100 {
            if factory.shutdowns() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(factory.starts(), 1);
        assert_eq!(factory.shutdowns(), 1);
        assert!(registry.lookup("web").is_none());
    }
}
