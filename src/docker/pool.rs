use anyhow::{Context, Result};
use bollard::container::Config;
use bollard::models::{
    DeviceMapping, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{DockerClient, PoolConfig};

/// Readiness probe against the in-container streaming endpoint.
const PROBE_INTERVAL: Duration = Duration::from_secs(2);
const PROBE_CEILING: Duration = Duration::from_secs(120);
/// A container still booting past this age has exhausted its probe window
/// and gets recycled by the health loop.
const BOOT_RECYCLE_AFTER_SECS: i64 = 130;
const STOP_GRACE_SECS: i64 = 5;
const HEALTH_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Booting,
    Warm,
    Active,
    Destroying,
}

/// Read-only snapshot of a pooled container. Handles never escape the pool;
/// callers get copies of this.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub id: Uuid,
    pub native_id: String,
    pub name: String,
    pub port: u16,
    pub status: ContainerStatus,
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PoolContainer {
    id: Uuid,
    native_id: String,
    name: String,
    port: u16,
    status: ContainerStatus,
    session_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl PoolContainer {
    fn to_info(&self) -> ContainerInfo {
        ContainerInfo {
            id: self.id,
            native_id: self.native_id.clone(),
            name: self.name.clone(),
            port: self.port,
            status: self.status,
            session_id: self.session_id,
            created_at: self.created_at,
        }
    }
}

#[derive(Default)]
struct PoolInner {
    containers: HashMap<Uuid, PoolContainer>,
    used_ports: BTreeSet<u16>,
}

impl PoolInner {
    /// Lowest free port in the configured range.
    fn allocate_port(&mut self, start: u16, end: u16) -> Option<u16> {
        let port = (start..=end).find(|p| !self.used_ports.contains(p))?;
        self.used_ports.insert(port);
        Some(port)
    }

    fn free_port(&mut self, port: u16) {
        self.used_ports.remove(&port);
    }
}

fn container_name(id: &Uuid) -> String {
    format!("session-{}", &id.simple().to_string()[..8])
}

/// Matches the pool's naming pattern `session-<8-hex>`. Used on startup to
/// sweep orphans left over from a previous process.
fn is_pool_container_name(name: &str) -> bool {
    name.strip_prefix("session-").is_some_and(|suffix| {
        suffix.len() == 8
            && suffix
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    })
}

/// Warm pool of sandboxed browser containers. All registry state sits behind
/// one mutex; Docker calls and probes run outside it.
pub struct ContainerPool {
    client: Arc<DockerClient>,
    config: PoolConfig,
    target_size: AtomicUsize,
    inner: Mutex<PoolInner>,
}

impl ContainerPool {
    pub fn new(client: Arc<DockerClient>, config: PoolConfig, initial_size: usize) -> Self {
        Self {
            client,
            config,
            target_size: AtomicUsize::new(initial_size),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn target_size(&self) -> usize {
        self.target_size.load(Ordering::SeqCst)
    }

    /// Update the target pool size. Growth happens on the next health tick;
    /// shrinking is passive - excess containers drain as sessions release them.
    pub fn set_pool_size(&self, n: usize) {
        info!("Pool target size set to {}", n);
        self.target_size.store(n, Ordering::SeqCst);
    }

    /// Startup: isolated network, orphan sweep, then the initial warm fleet
    /// created in parallel.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.client
            .ensure_network(&self.config.network_name)
            .await?;

        self.cleanup_orphans().await?;

        if !self.client.image_exists(&self.config.image).await {
            self.client.pull_image(&self.config.image).await?;
        }

        let target = self.target_size();
        info!("Creating {} warm containers", target);

        let creates = (0..target).map(|_| {
            let pool = Arc::clone(self);
            async move {
                if let Err(e) = pool.create_warm().await {
                    error!("Failed to create warm container: {:#}", e);
                }
            }
        });
        futures::future::join_all(creates).await;

        Ok(())
    }

    /// Remove containers left behind by a previous run. Anything matching the
    /// pool naming pattern is fair game - in-flight state did not survive the
    /// restart, so neither should the containers.
    async fn cleanup_orphans(&self) -> Result<()> {
        let names = self
            .client
            .list_container_names()
            .await
            .context("Orphan sweep failed to list containers")?;

        let orphans: Vec<String> = names.into_iter().filter(|n| is_pool_container_name(n)).collect();

        if orphans.is_empty() {
            return Ok(());
        }

        info!("Removing {} orphaned session containers", orphans.len());
        for name in orphans {
            if let Err(e) = self.client.remove_container(&name, true).await {
                warn!("Failed to remove orphan {}: {}", name, e);
            }
        }

        Ok(())
    }

    /// Create one warm container: allocate a port, create and start the
    /// sandbox, then probe it to readiness in the background.
    pub async fn create_warm(self: &Arc<Self>) -> Result<()> {
        let id = Uuid::new_v4();
        let name = container_name(&id);

        let port = {
            let mut inner = self.inner.lock().await;
            inner
                .allocate_port(self.config.port_range_start, self.config.port_range_end)
                .context("Port range exhausted")?
        };

        let config = self.container_config(port);

        let native_id = match self.client.create_container(&name, config).await {
            Ok(native_id) => native_id,
            Err(e) => {
                self.inner.lock().await.free_port(port);
                return Err(e);
            }
        };

        if let Err(e) = self.client.start_container(&native_id).await {
            self.inner.lock().await.free_port(port);
            let _ = self.client.remove_container(&native_id, true).await;
            return Err(e);
        }

        {
            let mut inner = self.inner.lock().await;
            inner.containers.insert(
                id,
                PoolContainer {
                    id,
                    native_id,
                    name: name.clone(),
                    port,
                    status: ContainerStatus::Booting,
                    session_id: None,
                    created_at: Utc::now(),
                },
            );
        }

        info!("Container {} booting on port {}", name, port);

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.probe_until_warm(id, port).await;
        });

        Ok(())
    }

    /// Poll the mapped streaming port until it answers. The first response
    /// flips Booting to Warm - the only transition into Warm there is.
    async fn probe_until_warm(&self, id: Uuid, port: u16) {
        let url = format!("http://127.0.0.1:{}/", port);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();

        let deadline = tokio::time::Instant::now() + PROBE_CEILING;
        let mut ticker = interval(PROBE_INTERVAL);

        loop {
            ticker.tick().await;

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Container {} not ready after {}s, leaving for health loop",
                    id,
                    PROBE_CEILING.as_secs()
                );
                return;
            }

            // Stop probing once the container left the pool or moved on.
            {
                let inner = self.inner.lock().await;
                match inner.containers.get(&id) {
                    Some(c) if c.status == ContainerStatus::Booting => {}
                    _ => return,
                }
            }

            if http.get(&url).send().await.is_ok() {
                let mut inner = self.inner.lock().await;
                if let Some(c) = inner.containers.get_mut(&id) {
                    if c.status == ContainerStatus::Booting {
                        c.status = ContainerStatus::Warm;
                        info!("Container {} is warm on port {}", c.name, port);
                    }
                }
                return;
            }

            debug!("Container {} not answering yet on port {}", id, port);
        }
    }

    /// Hand the first warm container to a session. Returns None when nothing
    /// is warm - the admission queue retries.
    pub async fn acquire(&self, session_id: Uuid) -> Option<ContainerInfo> {
        let mut inner = self.inner.lock().await;
        let container = inner
            .containers
            .values_mut()
            .find(|c| c.status == ContainerStatus::Warm)?;

        container.status = ContainerStatus::Active;
        container.session_id = Some(session_id);
        info!(
            "Container {} acquired for session {}",
            container.name, session_id
        );
        Some(container.to_info())
    }

    /// Release a container after its session ended. Idempotent and
    /// non-blocking: the destroy and the replacement both run in the
    /// background.
    pub async fn release(self: &Arc<Self>, id: Uuid) {
        let removed = {
            let mut inner = self.inner.lock().await;
            match inner.containers.remove(&id) {
                Some(mut container) => {
                    container.status = ContainerStatus::Destroying;
                    inner.free_port(container.port);
                    Some(container)
                }
                None => None,
            }
        };

        let Some(container) = removed else {
            return;
        };

        info!("Releasing container {}", container.name);
        self.spawn_destroy(container.native_id.clone());

        // Replace up to the current target so the steady-state size holds.
        // A shrunken target drains here instead.
        let (count, target) = {
            let inner = self.inner.lock().await;
            (inner.containers.len(), self.target_size())
        };
        if count < target {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = pool.create_warm().await {
                    error!("Replacement container failed, health loop will retry: {:#}", e);
                }
            });
        }
    }

    fn spawn_destroy(&self, native_id: String) {
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            if let Err(e) = client.stop_container(&native_id, STOP_GRACE_SECS).await {
                debug!("Graceful stop failed for {}: {}", native_id, e);
            }
            if let Err(e) = client.remove_container(&native_id, true).await {
                warn!("Failed to remove container {}: {}", native_id, e);
            }
        });
    }

    /// Fire-and-forget launch of the user's URL inside the container. A
    /// failure leaves the session up with an idle browser.
    pub fn launch_app(&self, container: &ContainerInfo, url: &str) {
        let client = Arc::clone(&self.client);
        let native_id = container.native_id.clone();
        let name = container.name.clone();
        let url = url.to_string();

        tokio::spawn(async move {
            let cmd = vec!["/opt/kiosk/scripts/launch-url.sh".to_string(), url];
            if let Err(e) = client.exec_command(&native_id, cmd).await {
                warn!("Failed to launch URL in container {}: {}", name, e);
            }
        });
    }

    pub fn spawn_health_loop(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(HEALTH_TICK);
            loop {
                ticker.tick().await;
                pool.health_sweep().await;
            }
        });
    }

    /// One health pass: recycle dead or boot-stuck containers, then grow the
    /// pool back to target.
    async fn health_sweep(self: &Arc<Self>) {
        let snapshot: Vec<(Uuid, String, ContainerStatus, DateTime<Utc>)> = {
            let inner = self.inner.lock().await;
            inner
                .containers
                .values()
                .filter(|c| c.status != ContainerStatus::Destroying)
                .map(|c| (c.id, c.native_id.clone(), c.status, c.created_at))
                .collect()
        };

        for (id, native_id, status, created_at) in snapshot {
            let dead = match self.client.inspect_container(&native_id).await {
                Ok(info) => {
                    let running = info.state.and_then(|s| s.running).unwrap_or(false);
                    let boot_stuck = status == ContainerStatus::Booting
                        && (Utc::now() - created_at).num_seconds() > BOOT_RECYCLE_AFTER_SECS;
                    !running || boot_stuck
                }
                Err(_) => true,
            };

            if !dead {
                continue;
            }

            warn!("Container {} unhealthy, recycling", native_id);
            let removed = {
                let mut inner = self.inner.lock().await;
                match inner.containers.get(&id) {
                    Some(c) if c.status != ContainerStatus::Destroying => {
                        let port = c.port;
                        inner.containers.remove(&id);
                        inner.free_port(port);
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                let client = Arc::clone(&self.client);
                tokio::spawn(async move {
                    let _ = client.remove_container(&native_id, true).await;
                });
            }
        }

        let (count, target) = {
            let inner = self.inner.lock().await;
            (inner.containers.len(), self.target_size())
        };
        if count < target {
            info!("Pool at {}/{}, creating {}", count, target, target - count);
            for _ in count..target {
                if let Err(e) = self.create_warm().await {
                    error!("Failed to grow pool: {:#}", e);
                    break;
                }
            }
        }
    }

    /// Destroy every warm container (active ones are untouched) and rebuild
    /// the fleet to target.
    pub async fn restart(self: &Arc<Self>) -> usize {
        let drained: Vec<PoolContainer> = {
            let mut inner = self.inner.lock().await;
            let warm_ids: Vec<Uuid> = inner
                .containers
                .values()
                .filter(|c| c.status == ContainerStatus::Warm)
                .map(|c| c.id)
                .collect();

            warm_ids
                .into_iter()
                .filter_map(|id| {
                    let mut c = inner.containers.remove(&id)?;
                    c.status = ContainerStatus::Destroying;
                    let port = c.port;
                    inner.free_port(port);
                    Some(c)
                })
                .collect()
        };

        info!("Pool restart: destroying {} warm containers", drained.len());
        let destroyed = drained.len();
        for container in drained {
            self.spawn_destroy(container.native_id);
        }

        let (count, target) = {
            let inner = self.inner.lock().await;
            (inner.containers.len(), self.target_size())
        };
        for _ in count..target {
            if let Err(e) = self.create_warm().await {
                error!("Failed to rebuild pool: {:#}", e);
                break;
            }
        }

        destroyed
    }

    pub async fn warm_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .containers
            .values()
            .filter(|c| c.status == ContainerStatus::Warm)
            .count()
    }

    pub async fn status(&self) -> Vec<ContainerInfo> {
        let inner = self.inner.lock().await;
        let mut containers: Vec<ContainerInfo> =
            inner.containers.values().map(|c| c.to_info()).collect();
        containers.sort_by_key(|c| c.created_at);
        containers
    }

    /// Sandbox container definition: dropped capabilities, bounded cpu and
    /// memory, isolated network, read-only config mounts, writable /tmp only,
    /// GPU device for the encoder.
    fn container_config(&self, port: u16) -> Config<String> {
        let stream_key = format!("{}/tcp", self.config.stream_port);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            stream_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(stream_key, HashMap::new());

        let binds = self.config.mounts_dir.as_ref().map(|dir| {
            vec![
                format!("{}/policies:/etc/kiosk/policies:ro", dir),
                format!("{}/scripts:/opt/kiosk/scripts:ro", dir),
                format!("{}/assets:/opt/kiosk/assets:ro", dir),
            ]
        });

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,size=256m".to_string());

        let mut labels = HashMap::new();
        labels.insert("cloudbrowser.managed".to_string(), "true".to_string());

        let env = vec![
            format!("STREAM_PORT={}", self.config.stream_port),
            "KIOSK_MODE=1".to_string(),
        ];

        let host_config = HostConfig {
            memory: Some(self.config.memory_limit_bytes),
            memory_swap: Some(self.config.memory_limit_bytes), // Prevent swap usage
            cpu_quota: Some((self.config.cpu_limit * 100000.0) as i64),
            cpu_period: Some(100000),
            shm_size: Some(self.config.shm_size_bytes),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            network_mode: Some(self.config.network_name.clone()),
            port_bindings: Some(port_bindings),
            binds,
            tmpfs: Some(tmpfs),
            devices: Some(vec![DeviceMapping {
                path_on_host: Some("/dev/dri".to_string()),
                path_in_container: Some("/dev/dri".to_string()),
                cgroup_permissions: Some("rwm".to_string()),
            }]),
            auto_remove: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(self.config.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_allocation_prefers_lowest_free() {
        let mut inner = PoolInner::default();
        assert_eq!(inner.allocate_port(4000, 4002), Some(4000));
        assert_eq!(inner.allocate_port(4000, 4002), Some(4001));
        assert_eq!(inner.allocate_port(4000, 4002), Some(4002));
        assert_eq!(inner.allocate_port(4000, 4002), None);

        inner.free_port(4001);
        assert_eq!(inner.allocate_port(4000, 4002), Some(4001));
    }

    #[test]
    fn free_port_is_idempotent() {
        let mut inner = PoolInner::default();
        assert_eq!(inner.allocate_port(4000, 4000), Some(4000));
        inner.free_port(4000);
        inner.free_port(4000);
        assert_eq!(inner.allocate_port(4000, 4000), Some(4000));
    }

    #[test]
    fn container_names_match_recovery_pattern() {
        let id = Uuid::new_v4();
        assert!(is_pool_container_name(&container_name(&id)));
    }

    #[test]
    fn orphan_matcher_rejects_foreign_names() {
        assert!(is_pool_container_name("session-0a1b2c3d"));
        assert!(!is_pool_container_name("session-0a1b2c"));
        assert!(!is_pool_container_name("session-0a1b2c3d4e"));
        assert!(!is_pool_container_name("session-ZZZZZZZZ"));
        assert!(!is_pool_container_name("other-session-deadbeef"));
        assert!(!is_pool_container_name("postgres"));
    }
}
