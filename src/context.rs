use std::sync::Arc;
use std::time::Duration;

use ethers::core::k256::SecretKey;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use tokio::sync::broadcast;

use crate::config::{ChainConfig, RelayerConfig};
use crate::error::{Error, Result};
use crate::resolver::ResolverRegistry;

/// RelayerContext contains the configuration, the custom resolver
/// registry, and the shutdown signal shared by every background task.
#[derive(Clone)]
pub struct RelayerContext {
    /// The loaded configuration.
    pub config: Arc<RelayerConfig>,
    /// Broadcasts a shutdown signal to all active tasks.
    ///
    /// The initial trigger is provided by the `main` caller. When a task
    /// is spawned, it is passed a broadcast receiver handle; on graceful
    /// shutdown a `()` value is sent, each task reaches a safe terminal
    /// state and completes.
    notify_shutdown: broadcast::Sender<()>,
    resolver_registry: ResolverRegistry,
}

impl RelayerContext {
    /// Creates a new RelayerContext.
    pub fn new(config: RelayerConfig) -> Self {
        let (notify_shutdown, _) = broadcast::channel(2);
        Self {
            config: Arc::new(config),
            notify_shutdown,
            resolver_registry: ResolverRegistry::default(),
        }
    }

    /// Registers a custom resolver function; must happen before the
    /// services start.
    pub fn register_custom_resolver<F>(&mut self, id: impl Into<String>, function: F)
    where
        F: Fn(&str, &crate::types::EventData, &str) -> Result<Vec<String>>
            + Send
            + Sync
            + 'static,
    {
        self.resolver_registry.register(id, function);
    }

    /// The custom resolver registry.
    pub fn resolver_registry(&self) -> &ResolverRegistry {
        &self.resolver_registry
    }

    /// Returns a broadcast receiver handle for the shutdown signal.
    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    /// Sends a shutdown signal to all subscribed tasks.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
    }

    /// The configuration of a chain, by name.
    pub fn chain(&self, chain_name: &str) -> Result<&ChainConfig> {
        self.config
            .chains
            .get(chain_name)
            .ok_or_else(|| Error::ChainNotFound {
                chain: chain_name.to_string(),
            })
    }

    /// Returns a new HTTP provider for the given chain.
    pub fn evm_provider(&self, chain_name: &str) -> Result<Provider<Http>> {
        let chain = self.chain(chain_name)?;
        let provider = Provider::try_from(chain.rpc_endpoint.as_str())
            .map_err(|e| Error::Rpc(e.to_string()))?
            .interval(Duration::from_millis(5u64));
        Ok(provider)
    }

    /// Sets up and returns the signing wallet for the given chain.
    pub fn evm_wallet(&self, chain_name: &str) -> Result<LocalWallet> {
        let chain = self.chain(chain_name)?;
        let private_key = chain.private_key.as_ref().ok_or(Error::MissingSecrets)?;
        let key = SecretKey::from_bytes(private_key.as_fixed_bytes().into())?;
        let wallet = LocalWallet::from(key).with_chain_id(chain.chain_id);
        Ok(wallet)
    }
}

/// Listens for the shutdown signal.
///
/// Shutdown is signalled using a `broadcast::Receiver`. Only a single
/// value is ever sent; once it has been received the task should wind
/// down. The struct remembers that the signal was seen so `recv` returns
/// immediately on later calls.
#[derive(Debug)]
pub struct Shutdown {
    shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Create a new `Shutdown` backed by the given `broadcast::Receiver`.
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        if self.shutdown {
            return;
        }
        // cannot receive a "lag error" as only one value is ever sent.
        let _ = self.notify.recv().await;
        self.shutdown = true;
    }
}
