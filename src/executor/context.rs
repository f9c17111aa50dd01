// Run-wide execution context shared by every host worker

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::{Connector, DefaultConnector};
use crate::actions::ActionRegistry;
use crate::config::RunnerConfig;
use crate::inventory::InventorySource;
use crate::modules::ModuleConfigurator;
use crate::plugins::CallbackManager;
use crate::template::{JinjaTemplar, Templar};
use crate::value::VarMap;
use crate::vars::{ReservedVars, VarCache, VariableResolver};

/// Locks owned by a run.
///
/// `console` serializes terminal output; `rng` guards the run's random
/// source. Neither is held across remote I/O.
#[derive(Clone)]
pub struct RunLocks {
    pub console: Arc<Mutex<()>>,
    rng: Arc<Mutex<StdRng>>,
}

impl RunLocks {
    pub fn new() -> Self {
        RunLocks {
            console: Arc::new(Mutex::new(())),
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Uniform value in `0..=max`
    pub fn random_up_to(&self, max: u64) -> u64 {
        self.rng.lock().gen_range(0..=max)
    }

    fn random_bytes(&self, buf: &mut [u8]) {
        self.rng.lock().fill_bytes(buf);
    }
}

impl Default for RunLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable state for one engine instance, handed to every worker
pub struct RunContext {
    pub config: RunnerConfig,
    pub inventory: Arc<dyn InventorySource>,
    pub templar: Arc<dyn Templar>,
    pub connector: Arc<dyn Connector>,
    pub actions: Arc<ActionRegistry>,
    pub modules: Arc<ModuleConfigurator>,
    pub callbacks: CallbackManager,
    pub facts_cache: Arc<VarCache>,
    pub vars_cache: Arc<VarCache>,
    pub resolver: VariableResolver,
    pub omit_token: String,
    pub playbook_dir: PathBuf,
    /// Strip non-printable characters from module stdout (interactive terminals)
    pub scrub_output: bool,
    pub locks: RunLocks,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn builder(inventory: Arc<dyn InventorySource>) -> RunContextBuilder {
        RunContextBuilder::new(inventory)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct RunContextBuilder {
    config: RunnerConfig,
    inventory: Arc<dyn InventorySource>,
    templar: Option<Arc<dyn Templar>>,
    connector: Option<Arc<dyn Connector>>,
    actions: Option<Arc<ActionRegistry>>,
    callbacks: CallbackManager,
    facts_cache: Arc<VarCache>,
    vars_cache: Arc<VarCache>,
    extra_vars: VarMap,
    playbook_dir: Option<PathBuf>,
    scrub_output: bool,
    locks: Option<RunLocks>,
    cancel: CancellationToken,
}

impl RunContextBuilder {
    pub fn new(inventory: Arc<dyn InventorySource>) -> Self {
        RunContextBuilder {
            config: RunnerConfig::default(),
            inventory,
            templar: None,
            connector: None,
            actions: None,
            callbacks: CallbackManager::new(),
            facts_cache: Arc::new(VarCache::new()),
            vars_cache: Arc::new(VarCache::new()),
            extra_vars: VarMap::new(),
            playbook_dir: None,
            scrub_output: false,
            locks: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn templar(mut self, templar: Arc<dyn Templar>) -> Self {
        self.templar = Some(templar);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn actions(mut self, actions: Arc<ActionRegistry>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn callbacks(mut self, callbacks: CallbackManager) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Share fact and runtime-variable caches across runs
    pub fn caches(mut self, facts: Arc<VarCache>, vars: Arc<VarCache>) -> Self {
        self.facts_cache = facts;
        self.vars_cache = vars;
        self
    }

    pub fn extra_vars(mut self, extra_vars: VarMap) -> Self {
        self.extra_vars = extra_vars;
        self
    }

    pub fn playbook_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.playbook_dir = Some(dir.into());
        self
    }

    pub fn scrub_output(mut self, scrub: bool) -> Self {
        self.scrub_output = scrub;
        self
    }

    /// Share locks with output plugins created before the context
    pub fn locks(mut self, locks: RunLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn build(self) -> Arc<RunContext> {
        let locks = self.locks.unwrap_or_default();
        let mut seed = [0u8; 64];
        locks.random_bytes(&mut seed);
        let omit_token = format!(
            "__omit_place_holder__{}",
            Sha256::digest(seed)
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<String>()
        );

        let templar = self
            .templar
            .unwrap_or_else(|| Arc::new(JinjaTemplar::new()));
        let playbook_dir = self
            .playbook_dir
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let resolver = VariableResolver::new(
            self.inventory.clone(),
            templar.clone(),
            self.facts_cache.clone(),
            self.vars_cache.clone(),
            self.extra_vars,
            ReservedVars {
                omit: omit_token.clone(),
                playbook_dir: playbook_dir.display().to_string(),
                remote_user: self.config.remote_user.clone(),
            },
        );

        let modules = Arc::new(
            ModuleConfigurator::new(self.config.module_paths.clone(), self.config.builtin_modules)
                .with_lang(self.config.module_lang.clone()),
        );

        Arc::new(RunContext {
            inventory: self.inventory,
            templar,
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(DefaultConnector::new())),
            actions: self
                .actions
                .unwrap_or_else(|| Arc::new(ActionRegistry::builtin())),
            modules,
            callbacks: self.callbacks,
            facts_cache: self.facts_cache,
            vars_cache: self.vars_cache,
            resolver,
            omit_token,
            playbook_dir,
            scrub_output: self.scrub_output,
            locks,
            cancel: self.cancel,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Inventory;

    #[test]
    fn test_omit_token_is_unique_per_context() {
        let inventory: Arc<dyn InventorySource> = Arc::new(Inventory::new());
        let a = RunContext::builder(inventory.clone()).build();
        let b = RunContext::builder(inventory).build();

        assert!(a.omit_token.starts_with("__omit_place_holder__"));
        assert_eq!(a.omit_token.len(), "__omit_place_holder__".len() + 64);
        assert_ne!(a.omit_token, b.omit_token);
    }

    #[test]
    fn test_random_up_to_stays_in_range() {
        let locks = RunLocks::new();
        for _ in 0..100 {
            assert!(locks.random_up_to(3) <= 3);
        }
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancellationToken::new();
        let ctx = RunContext::builder(Arc::new(Inventory::new()))
            .cancel_token(token.clone())
            .build();
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
