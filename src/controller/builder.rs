//! Controller construction.
//!
//! Every collaborator has a production default derived from [`Config`];
//! tests and embedders swap them out one at a time:
//!
//! ```ignore
//! let controller = ControllerBuilder::new(config)
//!     .executor(Arc::new(RecordingExecutor::new(true)))
//!     .package_registry(Arc::new(StaticPackageRegistry::new().with_package("pkg.a", 10100)))
//!     .network_provider(Arc::new(FixedNetworkType::new(NetworkType::Wifi)))
//!     .build()?;
//! ```

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{info, warn};

use super::error::ControllerError;
use super::orchestrator::{PerAppNetworkController, Shared};
use super::registry::AppRegistry;
use super::state::BlockStateStore;
use super::tier::{AppLevelOnly, EnforcementTier, PrivilegedTier};
use crate::config::{Config, ProcessSource};
use crate::firewall::SystemNetworkController;
use crate::interceptor::NetworkInterceptor;
use crate::monitor::{AntiBypassDetector, ProcessMonitor};
use crate::netif::NetworkInterfaceController;
use crate::platform::{
    NetworkTypeProvider, PackageRegistry, PackagesListRegistry, ProcessTable,
    ProcfsProcessTable, PsProcessTable, SysfsNetworkType,
};
use crate::privileged::{PrivilegedExecutor, SuExecutor, UnprivilegedExecutor};
use crate::proxy::ContentPolicy;

/// Builds a [`PerAppNetworkController`].
pub struct ControllerBuilder {
    config: Config,
    executor: Option<Arc<dyn PrivilegedExecutor>>,
    registry: Option<Arc<dyn PackageRegistry>>,
    network: Option<Arc<dyn NetworkTypeProvider>>,
    processes: Option<Arc<dyn ProcessTable>>,
}

impl ControllerBuilder {
    /// Start from `config` with production collaborators.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            executor: None,
            registry: None,
            network: None,
            processes: None,
        }
    }

    /// Use `executor` for privileged commands.
    pub fn executor(mut self, executor: Arc<dyn PrivilegedExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use `registry` for package → UID lookups.
    pub fn package_registry(mut self, registry: Arc<dyn PackageRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use `network` for the current network type.
    pub fn network_provider(mut self, network: Arc<dyn NetworkTypeProvider>) -> Self {
        self.network = Some(network);
        self
    }

    /// Use `processes` for pid lookups.
    pub fn process_table(mut self, processes: Arc<dyn ProcessTable>) -> Self {
        self.processes = Some(processes);
        self
    }

    /// Probe for privilege once and assemble the controller.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<PerAppNetworkController, ControllerError> {
        let runtime = Handle::try_current().map_err(|_| ControllerError::NoRuntime)?;
        let config = self.config;

        let executor = self.executor.unwrap_or_else(|| {
            Arc::new(SuExecutor::new(config.privileged.su_binary())) as Arc<dyn PrivilegedExecutor>
        });
        let registry = self.registry.unwrap_or_else(|| {
            Arc::new(PackagesListRegistry::new(config.platform.packages_list()))
                as Arc<dyn PackageRegistry>
        });
        let network = self.network.unwrap_or_else(|| {
            Arc::new(SysfsNetworkType::new(
                config.platform.sys_class_net(),
                config.platform.wifi_prefixes(),
                config.platform.cellular_prefixes(),
            )) as Arc<dyn NetworkTypeProvider>
        });
        let processes = self.processes.unwrap_or_else(|| match config.platform.process_source() {
            ProcessSource::Procfs => {
                Arc::new(ProcfsProcessTable::new(config.platform.proc_root())) as Arc<dyn ProcessTable>
            }
            ProcessSource::Ps => Arc::new(PsProcessTable::new(executor.clone())),
        });

        let content = Arc::new(ContentPolicy::from_settings(&config.proxy)?);

        let privileged = executor.is_available();
        let tier: Arc<dyn EnforcementTier> = if privileged {
            info!("Superuser shell available; kernel-level enforcement enabled");
            let firewall = Arc::new(SystemNetworkController::new(
                executor.clone(),
                registry,
                config.privileged.clone(),
            ));
            let interfaces =
                NetworkInterfaceController::new(executor.clone(), config.interfaces.clone());
            Arc::new(PrivilegedTier::new(firewall, interfaces))
        } else {
            warn!("No superuser shell; enforcing at app level only");
            Arc::new(AppLevelOnly)
        };

        let monitor_executor: Arc<dyn PrivilegedExecutor> = if privileged {
            executor
        } else {
            Arc::new(UnprivilegedExecutor)
        };
        let process_monitor = Arc::new(ProcessMonitor::with_procfs(
            processes,
            config.platform.proc_root(),
            config.monitor.process_poll_interval(),
        ));
        let detector = Arc::new(AntiBypassDetector::standard(
            config.platform.proc_root(),
            config.monitor.resolv_conf(),
            config.monitor.bypass_poll_interval(),
            monitor_executor,
            tier.firewall(),
            process_monitor,
        ));

        Ok(PerAppNetworkController::from_shared(Shared {
            proxy_settings: config.proxy,
            states: BlockStateStore::new(),
            apps: AppRegistry::default(),
            content,
            network,
            interceptor: NetworkInterceptor::new(),
            tier,
            detector,
            runtime,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{FixedNetworkType, NetworkType, StaticPackageRegistry, StaticProcessTable};
    use crate::privileged::{Program, RecordingExecutor};

    fn builder(available: bool) -> ControllerBuilder {
        ControllerBuilder::new(Config::default())
            .executor(Arc::new(RecordingExecutor::new(available)))
            .package_registry(Arc::new(StaticPackageRegistry::new()))
            .network_provider(Arc::new(FixedNetworkType::new(NetworkType::Other)))
            .process_table(Arc::new(StaticProcessTable::new()))
    }

    #[test]
    fn test_build_requires_runtime() {
        assert!(matches!(builder(false).build(), Err(ControllerError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_privilege_selects_tier() {
        assert!(builder(true).build().unwrap().is_privileged());
        assert!(!builder(false).build().unwrap().is_privileged());
    }

    #[tokio::test]
    async fn test_ps_process_source_lists_through_executor() {
        let mut config = Config::default();
        config.platform.process_source = Some(ProcessSource::Ps);
        let exec = Arc::new(RecordingExecutor::new(true));
        exec.set_output(Program::Ps, "PID NAME\n4242 pkg.a\n4300 pkg.b\n");

        let controller = ControllerBuilder::new(config)
            .executor(exec.clone())
            .package_registry(Arc::new(StaticPackageRegistry::new().with_package("pkg.a", 10100)))
            .network_provider(Arc::new(FixedNetworkType::new(NetworkType::Other)))
            .build()
            .unwrap();

        let processes = controller.detector().process_monitor();
        assert_eq!(processes.lookup("pkg.a").unwrap(), vec![4242]);
        assert!(!exec.commands_for(Program::Ps).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected() {
        let mut config = Config::default();
        config.proxy.blocked_url_patterns = vec!["(unclosed".to_string()];
        let result = ControllerBuilder::new(config)
            .executor(Arc::new(RecordingExecutor::new(false)))
            .build();
        assert!(matches!(result, Err(ControllerError::Policy(_))));
    }
}
