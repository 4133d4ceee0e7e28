//! The per-app network controller.
//!
//! `block_app_internet` and `allow_app_internet` write the block-state store
//! before returning, then spawn a reconcile for the package. A reconcile takes
//! the package's slot lock, reads the *latest* desired state and converges
//! every tier towards it, so concurrent calls settle on the last write.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::registry::{AppRegistry, AppRuntime};
use super::report::{tier, Action, EnforcementReport, EnforcementTask, TierOutcome, TierReport};
use super::state::{AppBlockState, BlockStateStore};
use super::tier::EnforcementTier;
use crate::config::ProxySettings;
use crate::interceptor::{InterceptPolicy, NetworkInterceptor};
use crate::monitor::{AntiBypassDetector, BypassEvent};
use crate::platform::NetworkTypeProvider;
use crate::proxy::{
    AppProxyServer, ContentPolicy, HeaderKeywordFilter, NetworkPolicy, PassThroughBody,
    PolicyEngine,
};
use crate::telemetry::{self, AuditEvent};

pub(crate) struct Shared {
    pub(crate) proxy_settings: ProxySettings,
    pub(crate) states: BlockStateStore,
    pub(crate) apps: AppRegistry,
    pub(crate) content: Arc<ContentPolicy>,
    pub(crate) network: Arc<dyn NetworkTypeProvider>,
    pub(crate) interceptor: NetworkInterceptor,
    pub(crate) tier: Arc<dyn EnforcementTier>,
    pub(crate) detector: Arc<AntiBypassDetector>,
    pub(crate) runtime: Handle,
}

/// Blocks and allows internet access per package.
///
/// Built by [`ControllerBuilder`](super::ControllerBuilder). Cheap to clone.
#[derive(Clone)]
pub struct PerAppNetworkController {
    shared: Arc<Shared>,
}

impl PerAppNetworkController {
    pub(crate) fn from_shared(shared: Shared) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Block `package` on the given transports.
    ///
    /// [`is_app_blocked`](Self::is_app_blocked) is `true` as soon as this
    /// returns; enforcement completes on the returned task.
    pub fn block_app_internet(
        &self,
        package: &str,
        block_wifi: bool,
        block_cellular: bool,
    ) -> EnforcementTask {
        self.shared
            .states
            .record_block(package, NetworkPolicy::new(block_wifi, block_cellular));
        info!(
            "Blocking {} (wifi: {}, cellular: {})",
            package, block_wifi, block_cellular
        );
        telemetry::record(AuditEvent::AppBlocked {
            package: package.to_string(),
            block_wifi,
            block_cellular,
        });
        self.spawn_reconcile(package)
    }

    /// Allow `package` again.
    ///
    /// [`is_app_blocked`](Self::is_app_blocked) is `false` as soon as this
    /// returns; teardown completes on the returned task.
    pub fn allow_app_internet(&self, package: &str) -> EnforcementTask {
        self.shared.states.record_allow(package);
        info!("Allowing {}", package);
        telemetry::record(AuditEvent::AppAllowed {
            package: package.to_string(),
        });
        self.spawn_reconcile(package)
    }

    fn spawn_reconcile(&self, package: &str) -> EnforcementTask {
        let shared = self.shared.clone();
        let package = package.to_string();
        EnforcementTask::new(self.shared.runtime.spawn(shared.reconcile(package)))
    }

    /// Whether `package` is currently supposed to be blocked.
    pub fn is_app_blocked(&self, package: &str) -> bool {
        self.shared.states.is_blocked(package)
    }

    /// Last recorded state of `package`.
    pub fn get_app_block_state(&self, package: &str) -> Option<AppBlockState> {
        self.shared.states.get(package)
    }

    /// Packages currently supposed to be blocked, sorted.
    pub fn get_all_blocked_apps(&self) -> Vec<String> {
        self.shared.states.blocked_packages()
    }

    /// Loopback port of `package`'s proxy, once it is listening.
    pub async fn proxy_port(&self, package: &str) -> Option<u16> {
        let slot = self.shared.apps.slot(package);
        let runtime = slot.lock().await;
        runtime.proxy.as_ref().map(AppProxyServer::port)
    }

    /// Whether the privileged tier is active on this device.
    pub fn is_privileged(&self) -> bool {
        self.shared.tier.is_privileged()
    }

    /// Receive bypass events for blocked packages.
    pub fn subscribe_bypass_events(&self) -> broadcast::Receiver<BypassEvent> {
        self.shared.detector.subscribe()
    }

    /// The interceptor set shared by every package.
    pub fn interceptor(&self) -> &NetworkInterceptor {
        &self.shared.interceptor
    }

    /// The anti-bypass detector.
    pub fn detector(&self) -> &Arc<AntiBypassDetector> {
        &self.shared.detector
    }

    /// Tear down every proxy, interceptor, rule and interface.
    ///
    /// Block states are left as recorded. Safe to call repeatedly.
    pub async fn cleanup(&self) -> Vec<EnforcementReport> {
        let mut reports = Vec::new();
        for (package, slot) in self.shared.apps.slots() {
            let mut runtime = slot.lock().await;
            if runtime.proxy.is_none() && !runtime.monitored {
                continue;
            }
            let tiers = self.shared.converge_allowed(&package, &mut runtime).await;
            reports.push(EnforcementReport {
                package,
                action: Action::Allow,
                tiers,
            });
        }

        let tier = self.shared.tier.clone();
        let detector = self.shared.detector.clone();
        let teardown = move || {
            let _guard = detector.expect_changes();
            tier.cleanup()
        };
        match tokio::task::spawn_blocking(teardown).await {
            Ok(tiers) => {
                for report in tiers.iter().filter(|r| r.outcome.is_failure()) {
                    warn!("Cleanup of {} tier: {}", report.tier, report.outcome);
                }
            }
            Err(e) => warn!("Privileged cleanup task failed: {}", e),
        }
        self.shared.detector.shutdown();
        info!("Cleanup complete ({} package(s) torn down)", reports.len());
        reports
    }
}

fn join_failure(e: tokio::task::JoinError) -> TierOutcome {
    TierOutcome::Failed(format!("enforcement task failed: {e}"))
}

impl Shared {
    fn policy_engine(&self, policy: NetworkPolicy) -> PolicyEngine {
        let engine = PolicyEngine::new(self.content.clone(), policy, self.network.clone());
        let agents = &self.proxy_settings.blocked_user_agents;
        if agents.is_empty() {
            return engine;
        }
        engine.with_filters(
            Arc::new(HeaderKeywordFilter::new("user-agent", agents)),
            Arc::new(PassThroughBody),
        )
    }

    async fn reconcile(self: Arc<Self>, package: String) -> EnforcementReport {
        let slot = self.apps.slot(&package);
        let mut runtime = slot.lock().await;

        // Read after locking: a newer call may have changed the target.
        match self.states.get(&package) {
            Some(state) if state.is_blocked => {
                let tiers = self.converge_blocked(&package, &state, &mut runtime).await;
                EnforcementReport {
                    package,
                    action: Action::Block,
                    tiers,
                }
            }
            _ => {
                let tiers = self.converge_allowed(&package, &mut runtime).await;
                EnforcementReport {
                    package,
                    action: Action::Allow,
                    tiers,
                }
            }
        }
    }

    async fn converge_blocked(
        &self,
        package: &str,
        state: &AppBlockState,
        runtime: &mut AppRuntime,
    ) -> Vec<TierReport> {
        let policy = state.network_policy();
        let mut tiers = Vec::with_capacity(5);

        let engine = match &runtime.proxy {
            Some(proxy) => {
                debug!("Reusing proxy on port {} for {}", proxy.port(), package);
                proxy.policy().set_network_policy(policy);
                tiers.push(TierReport::new(tier::PROXY, TierOutcome::Applied));
                proxy.policy().clone()
            }
            None => {
                let engine = Arc::new(self.policy_engine(policy));
                let outcome =
                    match AppProxyServer::start(package, engine.clone(), &self.proxy_settings)
                        .await
                    {
                        Ok(server) => {
                            runtime.proxy = Some(server);
                            TierOutcome::Applied
                        }
                        Err(e) => {
                            warn!("Proxy for {} did not start: {}", package, e);
                            TierOutcome::Failed(e.to_string())
                        }
                    };
                tiers.push(TierReport::new(tier::PROXY, outcome));
                engine
            }
        };

        let port = runtime.proxy.as_ref().map(AppProxyServer::port);
        self.interceptor
            .start_all(package, &InterceptPolicy::new(engine, port));
        tiers.push(TierReport::new(tier::INTERCEPTOR, TierOutcome::Applied));

        let kernel = self.tier.clone();
        let detector = self.detector.clone();
        let owned = package.to_string();
        let enforce = move || {
            let _guard = detector.expect_changes();
            kernel.enforce(&owned, policy)
        };
        match tokio::task::spawn_blocking(enforce).await {
            Ok(reports) => tiers.extend(reports),
            Err(e) => {
                tiers.push(TierReport::new(tier::FIREWALL, join_failure(e)));
            }
        }

        let outcome = if runtime.monitored {
            TierOutcome::Applied
        } else {
            let detector = self.detector.clone();
            let owned = package.to_string();
            match tokio::task::spawn_blocking(move || detector.start_monitoring(&owned)).await {
                Ok(()) => {
                    runtime.monitored = true;
                    TierOutcome::Applied
                }
                Err(e) => join_failure(e),
            }
        };
        tiers.push(TierReport::new(tier::MONITORING, outcome));

        tiers
    }

    async fn converge_allowed(&self, package: &str, runtime: &mut AppRuntime) -> Vec<TierReport> {
        let mut tiers = Vec::with_capacity(5);

        // Monitoring goes first so removing rules is not reported as tampering.
        let outcome = if runtime.monitored {
            let detector = self.detector.clone();
            let owned = package.to_string();
            match tokio::task::spawn_blocking(move || detector.stop_monitoring(&owned)).await {
                Ok(()) => {
                    runtime.monitored = false;
                    TierOutcome::Released
                }
                Err(e) => join_failure(e),
            }
        } else {
            TierOutcome::Released
        };
        tiers.push(TierReport::new(tier::MONITORING, outcome));

        let kernel = self.tier.clone();
        let detector = self.detector.clone();
        let owned = package.to_string();
        let release = move || {
            // Other packages may still be monitored.
            let _guard = detector.expect_changes();
            kernel.release(&owned)
        };
        match tokio::task::spawn_blocking(release).await {
            Ok(reports) => tiers.extend(reports),
            Err(e) => tiers.push(TierReport::new(tier::FIREWALL, join_failure(e))),
        }

        self.interceptor.stop_all(package);
        tiers.push(TierReport::new(tier::INTERCEPTOR, TierOutcome::Released));

        if let Some(proxy) = runtime.proxy.take() {
            let port = proxy.port();
            proxy.stop().await;
            debug!("Released proxy port {} of {}", port, package);
        }
        tiers.push(TierReport::new(tier::PROXY, TierOutcome::Released));

        tiers
    }
}
