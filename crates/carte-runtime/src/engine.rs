//! The runtime engine: every operation the `carte` shell exposes.
//!
//! Each engine invocation performs one operation. Cross-invocation safety
//! comes from the per-container lock in [`StateStore`] and the locks held by
//! the image catalog and the address allocator.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use carte_common::config::CarteConfig;
use carte_common::constants::DEFAULT_PATH;
use carte_common::error::{CarteError, Result};
use carte_common::types::{ContainerId, ImageRef, ResourceGrant, ResourceLimits, validate_name};
use carte_core::cgroup::CgroupManager;
use carte_core::namespace::{self, NamespaceConfig};
use carte_core::spawn::{self, ContainerProcess, ExitOutcome, ProcessSpawner, SpawnRequest, StdioMode};
use carte_image::builder::{BuildReport, ImageBuilder, SpawnExecutor};
use carte_image::package::{self, ImageConfig};
use carte_image::registry::{ImageCatalog, ImageEntry};
use carte_image::source;
use carte_image::storage::LayerStore;
use carte_network::{Attachment, NetworkAttacher};

use crate::container::{ContainerRecord, ContainerSummary};
use crate::logs;
use crate::process::{self, ExitWatch, Termination};
use crate::state::StateStore;

const IMAGE_CONFIG_FILE: &str = "config.json";

/// A container started by this invocation.
#[derive(Debug)]
pub struct RunningContainer {
    /// Record as persisted when the process started.
    pub record: ContainerRecord,
    /// Supervisor of the container process.
    pub watch: ExitWatch,
}

/// One row of `list_images`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    /// `name:tag`.
    pub reference: String,
    /// Short image ID.
    pub id: String,
    /// Number of layers.
    pub layers: usize,
    /// Package size in bytes.
    pub size_bytes: u64,
    /// Creation timestamp.
    pub created_at: String,
}

impl From<&ImageEntry> for ImageSummary {
    fn from(entry: &ImageEntry) -> Self {
        Self {
            reference: entry.reference().to_string(),
            id: entry.id.short().to_string(),
            layers: entry.layers.len(),
            size_bytes: entry.size_bytes,
            created_at: entry.created_at.clone(),
        }
    }
}

/// A spawned and released container process with its resources.
struct Launched {
    process: Box<dyn ContainerProcess>,
    start_time: Option<u64>,
    attachment: Attachment,
}

/// Coordinates images, processes, networking, cgroups, and state.
pub struct Runtime {
    config: CarteConfig,
    catalog: ImageCatalog,
    layers: LayerStore,
    state: StateStore,
    spawner: Arc<dyn ProcessSpawner>,
    network: Arc<dyn NetworkAttacher>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("data_dir", &self.config.data_dir)
            .field("network_mode", &self.config.network_mode)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Creates a runtime using the host's namespaces, cgroups, and network tools.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directories cannot be created or the
    /// network configuration is invalid.
    #[cfg(target_os = "linux")]
    pub fn new(config: CarteConfig) -> Result<Self> {
        let network = carte_network::from_config(&config, Arc::new(carte_network::command::SystemCommand))?;
        Self::with_components(config, Arc::new(spawn::NamespaceSpawner::new()), network)
    }

    /// Containers need Linux namespaces and cgroups.
    ///
    /// # Errors
    ///
    /// Always returns a resource error.
    #[cfg(not(target_os = "linux"))]
    pub fn new(_config: CarteConfig) -> Result<Self> {
        Err(CarteError::Resource {
            message: "carte requires Linux namespaces and cgroups".into(),
        })
    }

    /// Creates a runtime over explicit process and network backends.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directories cannot be created.
    pub fn with_components(
        config: CarteConfig,
        spawner: Arc<dyn ProcessSpawner>,
        network: Arc<dyn NetworkAttacher>,
    ) -> Result<Self> {
        let catalog = ImageCatalog::open(&config.images_dir())?;
        let layers = LayerStore::open(config.layers_dir())?;
        let state = StateStore::open(config.state_dir())?;
        for dir in [config.containers_dir(), config.tmp_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| CarteError::io(&dir, e))?;
        }
        tracing::debug!(data_dir = %config.data_dir.display(), "runtime ready");
        Ok(Self {
            config,
            catalog,
            layers,
            state,
            spawner,
            network,
        })
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &CarteConfig {
        &self.config
    }

    /// Builds `manifest` against `context` and tags the result `image`.
    ///
    /// # Errors
    ///
    /// Returns the first validation or step error; nothing is registered then.
    pub fn build_image(&self, manifest: &Path, context: &Path, image: &ImageRef) -> Result<BuildReport> {
        let executor = SpawnExecutor::new(
            Arc::clone(&self.spawner),
            NamespaceConfig::build(&self.config.namespaces, self.config.isolate_build_network),
            self.config.root_strategy,
        );
        let builder = ImageBuilder::new(
            self.catalog.clone(),
            self.layers.clone(),
            self.config.tmp_dir(),
            Arc::new(executor),
        );
        builder.build(manifest, context, image)
    }

    /// Registers a base image from a `file://` directory or `tar://` archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is unsupported or cannot be read.
    pub fn import_image(&self, image: &ImageRef, uri: &str) -> Result<ImageEntry> {
        source::import_image(&self.catalog, &self.config.tmp_dir(), image, uri)
    }

    /// All images in the catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn list_images(&self) -> Result<Vec<ImageSummary>> {
        Ok(self.catalog.list()?.iter().map(ImageSummary::from).collect())
    }

    /// Creates and starts a container named `name` from `image`.
    ///
    /// On failure every resource acquired so far is released and no record
    /// is written.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad names or limits, `NotFound` for an
    /// unknown image, `AlreadyExists` for a taken name, and the first
    /// setup error otherwise.
    pub fn run_container(&self, name: &str, image: &ImageRef, cpu: &str, memory: &str) -> Result<RunningContainer> {
        validate_name("container name", name)?;
        let grant = ResourceGrant::new(cpu, memory);
        let limits = grant.limits()?;
        let entry = self.catalog.get(image)?;

        let _lock = self.state.lock(name)?;
        if self.state.try_load(name)?.is_some() {
            return Err(CarteError::AlreadyExists {
                kind: "container",
                id: name.to_string(),
            });
        }

        let container_dir = self.container_dir(name);
        if container_dir.exists() {
            tracing::warn!(container = name, "removing leftover container directory");
            remove_dir(&container_dir)?;
        }

        let id = ContainerId::generate();
        let result = self
            .prepare_rootfs(&entry, &container_dir)
            .and_then(|image_config| self.launch(&id, name, &image_config, &limits, None))
            .and_then(|launched| {
                let mut record = ContainerRecord::running(
                    id.clone(),
                    name,
                    image.to_string(),
                    launched.process.pid(),
                    grant.clone(),
                    launched.attachment.ip_address.map(|ip| ip.to_string()),
                );
                record.pid_start_time = launched.start_time;
                self.persist_and_watch(record, launched)
            });

        if result.is_err() {
            if let Err(e) = remove_dir(&container_dir) {
                tracing::warn!(container = name, error = %e, "failed to clean up container directory");
            }
        }
        let running = result?;
        tracing::info!(
            container = name,
            id = %id.short(),
            pid = running.watch.pid(),
            image = %image,
            "container running"
        );
        Ok(running)
    }

    /// Starts a stopped container again in its existing root filesystem.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown container, `InvalidState` if it is
    /// running, and the first setup error otherwise.
    pub fn start_container(&self, name: &str) -> Result<RunningContainer> {
        let _lock = self.state.lock(name)?;
        let mut record = self.state.load(name)?;
        record.ensure_startable()?;

        let container_dir = self.container_dir(name);
        let image_config = read_image_config(&container_dir)?;
        let limits = record.resources.limits()?;
        let preferred = recorded_address(&record);

        let launched = self.launch(&record.id, name, &image_config, &limits, preferred)?;
        let ip = launched.attachment.ip_address;
        if let (Some(wanted), Some(got)) = (preferred, ip) {
            if wanted != got {
                tracing::warn!(container = name, previous = %wanted, assigned = %got, "container address changed");
            }
        }
        if let Err(e) = record.mark_running(launched.process.pid(), ip.map(|ip| ip.to_string())) {
            self.discard(&record.id, launched);
            return Err(e);
        }
        record.pid_start_time = launched.start_time;
        let running = self.persist_and_watch(record, launched)?;
        tracing::info!(container = name, pid = running.watch.pid(), "container started");
        Ok(running)
    }

    /// Stops a running container: SIGTERM, then SIGKILL after the grace period.
    ///
    /// The network is detached and the cgroup removed on a best-effort
    /// basis. A container whose process is already gone, or whose PID now
    /// belongs to another process, is recorded as stopped without sending
    /// any signal.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `InvalidState` if the container is not running,
    /// or a process error if the signal is refused; the record is unchanged
    /// in those cases.
    pub fn stop_container(&self, name: &str) -> Result<ContainerRecord> {
        let _lock = self.state.lock(name)?;
        let mut record = self.state.load(name)?;
        let pid = record.ensure_running("stop")?;

        let termination = if process::is_current(pid, record.pid_start_time) {
            let termination = process::terminate(pid, self.config.stop_grace())?;
            self.release_resources(&record, Some(pid));
            termination
        } else {
            tracing::warn!(container = name, pid, "recorded process no longer exists, not signaling");
            self.release_resources(&record, None);
            Termination::AlreadyExited
        };
        record.mark_stopped(termination.exit_code())?;
        self.state.save(&record)?;
        tracing::info!(container = name, pid, exit_code = ?record.exit_code, "container stopped");
        Ok(record)
    }

    /// Deletes a stopped container's files and record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `InvalidState` if the container is running.
    pub fn remove_container(&self, name: &str) -> Result<()> {
        let _lock = self.state.lock(name)?;
        let record = self.state.load(name)?;
        record.ensure_removable()?;
        remove_dir(&self.container_dir(name))?;
        self.state.delete(name)?;
        tracing::info!(container = name, id = %record.id.short(), "container removed");
        Ok(())
    }

    /// All containers, sorted by name.
    ///
    /// Running records whose process has vanished without a supervisor to
    /// notice (a detached run) are settled as stopped first.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directory cannot be read.
    pub fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let mut records = self.state.list()?;
        for record in &mut records {
            if record.is_running() && !owns_process(record) {
                if let Some(settled) = self.settle_vanished(&record.name)? {
                    *record = settled;
                }
            }
        }
        Ok(records.iter().map(ContainerRecord::summary).collect())
    }

    /// Marks `name` stopped if its recorded process is gone, re-checking
    /// under the container lock.
    fn settle_vanished(&self, name: &str) -> Result<Option<ContainerRecord>> {
        let _lock = self.state.lock(name)?;
        let Some(mut record) = self.state.try_load(name)? else {
            return Ok(None);
        };
        if !record.is_running() || owns_process(&record) {
            return Ok(Some(record));
        }
        self.release_resources(&record, None);
        record.mark_stopped(None)?;
        self.state.save(&record)?;
        tracing::info!(container = name, "container process vanished, recorded as stopped");
        Ok(Some(record))
    }

    /// Everything the container has written to stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown container.
    pub fn container_logs(&self, name: &str) -> Result<String> {
        let _ = self.state.load(name)?;
        logs::read_logs(&self.config.containers_dir(), name)
    }

    fn container_dir(&self, name: &str) -> PathBuf {
        self.config.containers_dir().join(name)
    }

    fn cgroup(&self, id: &ContainerId) -> CgroupManager {
        CgroupManager::new(&self.config.cgroup_root, self.config.cgroup_version, id.as_str())
    }

    /// Extracts the image into `<dir>/rootfs` and saves its runtime config.
    fn prepare_rootfs(&self, entry: &ImageEntry, container_dir: &Path) -> Result<ImageConfig> {
        let rootfs = container_dir.join("rootfs");
        std::fs::create_dir_all(&rootfs).map_err(|e| CarteError::io(&rootfs, e))?;
        let scratch = self
            .config
            .tmp_dir()
            .join(format!("extract-{}", uuid::Uuid::new_v4().simple()));
        let package = package::extract_rootfs(&entry.package, &rootfs, &scratch)?;

        let config_path = container_dir.join(IMAGE_CONFIG_FILE);
        std::fs::write(&config_path, serde_json::to_vec_pretty(&package.config.config)?)
            .map_err(|e| CarteError::io(&config_path, e))?;
        Ok(package.config.config)
    }

    /// Spawns the container process, attaches it, applies limits, and
    /// releases it to exec. Failures roll back in reverse order.
    fn launch(
        &self,
        id: &ContainerId,
        name: &str,
        image_config: &ImageConfig,
        limits: &ResourceLimits,
        preferred: Option<Ipv4Addr>,
    ) -> Result<Launched> {
        let args = image_config.process_args();
        if args.is_empty() {
            return Err(CarteError::validation("image defines neither ENTRYPOINT nor CMD"));
        }
        let mut env = image_config.env_vars.clone();
        if !env.iter().any(|kv| kv.starts_with("PATH=")) {
            env.push(format!("PATH={DEFAULT_PATH}"));
        }
        let workdir = if image_config.workdir.is_empty() {
            "/".to_string()
        } else {
            image_config.workdir.clone()
        };
        let container_dir = self.container_dir(name);
        let request = SpawnRequest {
            rootfs: container_dir.join("rootfs"),
            args,
            env,
            workdir,
            hostname: name.to_string(),
            namespaces: NamespaceConfig::container(&self.config.namespaces),
            root_strategy: self.config.root_strategy,
            stdio: StdioMode::LogFile(logs::log_path(&self.config.containers_dir(), name)),
        };

        let pending = self.spawner.spawn(&request)?;
        let pid = pending.pid();
        tracing::debug!(container = name, pid, "process spawned");

        let attachment = match self.network.attach(id.as_str(), pid, preferred) {
            Ok(attachment) => attachment,
            Err(e) => {
                pending.abort();
                return Err(e);
            }
        };

        let cgroup = self.cgroup(id);
        let limited = cgroup
            .create()
            .and_then(|()| cgroup.apply(limits))
            .and_then(|()| cgroup.add_process(pid));
        if let Err(e) = limited {
            pending.abort();
            self.detach_quietly(id, &attachment);
            destroy_quietly(&cgroup);
            return Err(e);
        }

        match pending.release() {
            Ok(process) => {
                let start_time = spawn::start_time(process.pid());
                Ok(Launched {
                    process,
                    start_time,
                    attachment,
                })
            }
            Err(e) => {
                self.detach_quietly(id, &attachment);
                destroy_quietly(&cgroup);
                Err(e)
            }
        }
    }

    /// Saves `record` and hands the process to a supervisor.
    fn persist_and_watch(&self, record: ContainerRecord, launched: Launched) -> Result<RunningContainer> {
        if let Err(e) = self.state.save(&record) {
            self.discard(&record.id, launched);
            return Err(e);
        }
        let recorder = ExitRecorder {
            state: self.state.clone(),
            network: Arc::clone(&self.network),
            cgroup: self.cgroup(&record.id),
            name: record.name.clone(),
            id: record.id.clone(),
            pid: launched.process.pid(),
            attachment: launched.attachment,
        };
        let watch = ExitWatch::spawn(&record.name, launched.process, move |outcome| recorder.record(outcome))?;
        Ok(RunningContainer { record, watch })
    }

    /// Kills a released process that could not be recorded.
    fn discard(&self, id: &ContainerId, launched: Launched) {
        let pid = launched.process.pid();
        if let Err(e) = spawn::send_signal(pid, nix::sys::signal::Signal::SIGKILL) {
            tracing::warn!(pid, error = %e, "failed to kill unrecorded process");
        }
        if let Err(e) = launched.process.wait() {
            tracing::warn!(pid, error = %e, "failed to reap unrecorded process");
        }
        self.detach_quietly(id, &launched.attachment);
        destroy_quietly(&self.cgroup(id));
    }

    /// Detaches the network and removes the cgroup. `netns_pid` is given only
    /// when the recorded PID is known to be the container's own process.
    fn release_resources(&self, record: &ContainerRecord, netns_pid: Option<u32>) {
        let attachment = Attachment {
            ip_address: recorded_address(record),
            netns: netns_pid.map(namespace::netns_path),
            ..Attachment::default()
        };
        self.detach_quietly(&record.id, &attachment);
        destroy_quietly(&self.cgroup(&record.id));
    }

    fn detach_quietly(&self, id: &ContainerId, attachment: &Attachment) {
        if let Err(e) = self.network.detach(id.as_str(), attachment) {
            tracing::warn!(id = %id.short(), error = %e, "network detach failed");
        }
    }
}

/// Records a supervised process's exit if nobody else has.
struct ExitRecorder {
    state: StateStore,
    network: Arc<dyn NetworkAttacher>,
    cgroup: CgroupManager,
    name: String,
    id: ContainerId,
    pid: u32,
    attachment: Attachment,
}

impl ExitRecorder {
    fn record(&self, outcome: &Result<ExitOutcome>) {
        if let Err(e) = self.try_record(outcome) {
            tracing::warn!(container = %self.name, error = %e, "failed to record container exit");
        }
    }

    fn try_record(&self, outcome: &Result<ExitOutcome>) -> Result<()> {
        let _lock = self.state.lock(&self.name)?;
        let Some(mut record) = self.state.try_load(&self.name)? else {
            return Ok(());
        };
        if !record.is_running() || record.pid != Some(self.pid) || record.id != self.id {
            return Ok(());
        }
        let exit_code = outcome.as_ref().ok().map(|o| o.code());
        if let Err(e) = self.network.detach(self.id.as_str(), &self.attachment) {
            tracing::warn!(container = %self.name, error = %e, "network detach failed");
        }
        destroy_quietly(&self.cgroup);
        record.mark_stopped(exit_code)?;
        self.state.save(&record)?;
        tracing::info!(container = %self.name, pid = self.pid, exit_code = ?exit_code, "container exited");
        Ok(())
    }
}

fn owns_process(record: &ContainerRecord) -> bool {
    record
        .pid
        .is_some_and(|pid| process::is_current(pid, record.pid_start_time))
}

fn destroy_quietly(cgroup: &CgroupManager) {
    if let Err(e) = cgroup.destroy() {
        tracing::warn!(path = %cgroup.cpu_dir().display(), error = %e, "cgroup removal failed");
    }
}

fn recorded_address(record: &ContainerRecord) -> Option<Ipv4Addr> {
    record.ip_address().and_then(|ip| ip.parse().ok())
}

fn read_image_config(container_dir: &Path) -> Result<ImageConfig> {
    let path = container_dir.join(IMAGE_CONFIG_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CarteError::NotFound {
            kind: "container filesystem",
            id: container_dir.display().to_string(),
        }),
        Err(e) => Err(CarteError::io(path, e)),
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CarteError::io(dir, e)),
    }
}
