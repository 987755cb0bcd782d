//! Container lifecycle against a temporary data directory.
//!
//! Processes are plain host children (`sleep`) started by a fake spawner,
//! cgroup files land in a temporary directory, and addresses come from a
//! real allocation store, so these tests run without root.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use carte_common::config::{CarteConfig, CgroupVersion};
use carte_common::error::{CarteError, Result};
use carte_common::types::{ContainerStatus, ImageRef};
use carte_core::spawn::{ContainerProcess, ExitOutcome, PendingProcess, ProcessSpawner, SpawnRequest, StdioMode};
use carte_network::state::AllocationStore;
use carte_network::{Attachment, NetworkAttacher};
use carte_runtime::Runtime;

/// Starts `sleep` on the host for containers and `true` for build steps.
#[derive(Default)]
struct HostSpawner {
    requests: Mutex<Vec<SpawnRequest>>,
    fail_containers: bool,
}

impl ProcessSpawner for HostSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn PendingProcess>> {
        self.requests.lock().unwrap().push(request.clone());
        let build_step = request.hostname == "carte-build";
        if self.fail_containers && !build_step {
            return Err(CarteError::Process {
                message: "clone refused".into(),
            });
        }
        let mut command = if build_step {
            Command::new("true")
        } else {
            let mut c = Command::new("sh");
            let _ = c.args(["-c", "echo \"hello from $0\"; exec sleep 30", &request.hostname]);
            c
        };
        if let StdioMode::LogFile(path) = &request.stdio {
            let log = OpenOptions::new().create(true).append(true).open(path).unwrap();
            let _ = command.stdin(Stdio::null()).stdout(log.try_clone().unwrap()).stderr(log);
        }
        let child = command.spawn().map_err(|e| CarteError::Process { message: e.to_string() })?;
        Ok(Box::new(HostChild(child)))
    }
}

struct HostChild(Child);

impl PendingProcess for HostChild {
    fn pid(&self) -> u32 {
        self.0.id()
    }

    fn release(self: Box<Self>) -> Result<Box<dyn ContainerProcess>> {
        Ok(self)
    }

    fn abort(mut self: Box<Self>) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

impl ContainerProcess for HostChild {
    fn pid(&self) -> u32 {
        self.0.id()
    }

    fn wait(mut self: Box<Self>) -> Result<ExitOutcome> {
        let status = self.0.wait().map_err(|e| CarteError::Process { message: e.to_string() })?;
        Ok(match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Exited(code),
            (None, signal) => ExitOutcome::Signaled(signal.unwrap_or(0)),
        })
    }
}

/// Hands out addresses from a real allocation store without touching links.
struct StoreNetwork {
    store: AllocationStore,
    attaches: AtomicUsize,
    detaches: AtomicUsize,
    fail: bool,
}

impl StoreNetwork {
    fn open(dir: &Path, fail: bool) -> Self {
        Self {
            store: AllocationStore::open(&dir.join("network"), "10.88.0.0/24".parse().unwrap()).unwrap(),
            attaches: AtomicUsize::new(0),
            detaches: AtomicUsize::new(0),
            fail,
        }
    }
}

impl NetworkAttacher for StoreNetwork {
    fn attach(&self, container_id: &str, _pid: u32, preferred: Option<Ipv4Addr>) -> Result<Attachment> {
        let _ = self.attaches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CarteError::Network {
                message: "bridge unavailable".into(),
            });
        }
        let ip = self.store.reserve(container_id, preferred)?;
        Ok(Attachment {
            ip_address: Some(ip),
            prefix_len: Some(24),
            gateway: Some(Ipv4Addr::new(10, 88, 0, 1)),
            netns: None,
        })
    }

    fn detach(&self, container_id: &str, _attachment: &Attachment) -> Result<()> {
        let _ = self.detaches.fetch_add(1, Ordering::SeqCst);
        let _ = self.store.release(container_id)?;
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    spawner: Arc<HostSpawner>,
    network: Arc<StoreNetwork>,
    runtime: Runtime,
}

impl Fixture {
    fn new() -> Self {
        Self::with(HostSpawner::default(), false)
    }

    fn with(spawner: HostSpawner, network_fails: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let mut config = CarteConfig::with_data_dir(root.join("data"));
        config.cgroup_root = root.join("cgroup");
        config.cgroup_version = CgroupVersion::V2;
        config.stop_grace_secs = 5;

        let spawner = Arc::new(spawner);
        let network = Arc::new(StoreNetwork::open(&root, network_fails));
        let runtime = Runtime::with_components(config, spawner.clone(), network.clone()).unwrap();

        let base = root.join("base-rootfs");
        std::fs::create_dir_all(base.join("bin")).unwrap();
        std::fs::write(base.join("bin/app"), "#!/bin/sh\n").unwrap();
        let _ = runtime
            .import_image(&ImageRef::new("base", "latest"), &format!("file://{}", base.display()))
            .unwrap();

        let context = root.join("context");
        std::fs::create_dir_all(&context).unwrap();
        std::fs::write(
            context.join("Cartefile"),
            "FROM base:latest\nRUN echo hi\nENV X=1\nCMD [\"/bin/app\"]\n",
        )
        .unwrap();
        let _ = runtime
            .build_image(&context.join("Cartefile"), &context, &app())
            .unwrap();

        Self {
            _dir: dir,
            root,
            spawner,
            network,
            runtime,
        }
    }

    fn cgroup_dir(&self, name: &str) -> PathBuf {
        let state = self.record_json(name);
        self.root.join("cgroup/carte").join(state["id"].as_str().unwrap())
    }

    fn container_dir(&self, name: &str) -> PathBuf {
        self.root.join("data/containers").join(name)
    }

    fn record_json(&self, name: &str) -> serde_json::Value {
        serde_json::from_str(&std::fs::read_to_string(self.state_file(name)).unwrap()).unwrap()
    }

    /// Rewrites a stopped record as still running under `pid`, the way a
    /// detached run leaves it when nothing watched the process exit.
    fn mark_running_on_disk(&self, name: &str, pid: u32, start_time: &serde_json::Value) {
        let mut record = self.record_json(name);
        record["status"] = "running".into();
        record["pid"] = pid.into();
        record["pid_start_time"] = start_time.clone();
        record["exit_code"] = serde_json::Value::Null;
        std::fs::write(self.state_file(name), serde_json::to_vec_pretty(&record).unwrap()).unwrap();
    }

    fn state_file(&self, name: &str) -> PathBuf {
        self.root.join(format!("data/state/{name}.json"))
    }
}

fn app() -> ImageRef {
    ImageRef::new("app", "latest")
}

fn wait_for_log(fx: &Fixture, name: &str) -> String {
    for _ in 0..100 {
        let logs = fx.runtime.container_logs(name).unwrap();
        if !logs.is_empty() {
            return logs;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    String::new()
}

#[test]
fn run_then_list_shows_running_container_with_limits() {
    let fx = Fixture::new();
    let running = fx.runtime.run_container("c1", &app(), "50%", "104857600").unwrap();

    let list = fx.runtime.list_containers().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "c1");
    assert_eq!(list[0].status, ContainerStatus::Running);
    assert_eq!(list[0].resources.cpu, "50%");
    assert_eq!(list[0].resources.memory, "104857600");
    assert_eq!(list[0].pid, Some(running.watch.pid()));
    assert_eq!(list[0].ip_address, "10.88.0.2");

    let cgroup = fx.cgroup_dir("c1");
    assert_eq!(std::fs::read_to_string(cgroup.join("memory.max")).unwrap(), "104857600");
    assert_eq!(std::fs::read_to_string(cgroup.join("cpu.max")).unwrap(), "50000 100000");
    assert_eq!(
        std::fs::read_to_string(cgroup.join("cgroup.procs")).unwrap(),
        running.watch.pid().to_string()
    );

    let request = fx.spawner.requests.lock().unwrap().last().cloned().unwrap();
    assert_eq!(request.args, ["/bin/app"]);
    assert!(request.env.contains(&"X=1".to_string()));
    assert!(request.env.iter().any(|kv| kv.starts_with("PATH=")));
    assert_eq!(request.rootfs, fx.container_dir("c1").join("rootfs"));
    assert!(request.rootfs.join("bin/app").exists());

    assert!(wait_for_log(&fx, "c1").contains("hello from c1"));
    let _ = fx.runtime.stop_container("c1").unwrap();
    let _ = running.watch.wait().unwrap();
}

#[test]
fn stop_then_remove_drops_the_container() {
    let fx = Fixture::new();
    let running = fx.runtime.run_container("c1", &app(), "50%", "100M").unwrap();

    let stopped = fx.runtime.stop_container("c1").unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert_eq!(stopped.pid, None);
    assert_eq!(stopped.exit_code, Some(143));
    assert_eq!(running.watch.wait().unwrap(), ExitOutcome::Signaled(15));
    assert_eq!(fx.network.detaches.load(Ordering::SeqCst), 1);

    let record = &fx.runtime.list_containers().unwrap()[0];
    assert_eq!(record.status, ContainerStatus::Stopped);
    assert_eq!(record.exit_code, Some(143));

    fx.runtime.remove_container("c1").unwrap();
    assert!(fx.runtime.list_containers().unwrap().is_empty());
    assert!(!fx.container_dir("c1").exists());
    assert!(matches!(
        fx.runtime.remove_container("c1"),
        Err(CarteError::NotFound { kind: "container", .. })
    ));
}

#[test]
fn remove_while_running_is_refused_and_record_unchanged() {
    let fx = Fixture::new();
    let running = fx.runtime.run_container("c1", &app(), "50%", "100M").unwrap();
    let before = fx.runtime.list_containers().unwrap();

    let err = fx.runtime.remove_container("c1").unwrap_err();
    assert!(matches!(err, CarteError::InvalidState { operation: "remove", .. }));
    assert!(err.to_string().contains("stop it first"));
    assert_eq!(fx.runtime.list_containers().unwrap(), before);
    assert!(fx.container_dir("c1").join("rootfs").exists());

    let _ = fx.runtime.stop_container("c1").unwrap();
    let _ = running.watch.wait().unwrap();
}

#[test]
fn start_after_stop_reuses_address_and_refreshes_pid() {
    let fx = Fixture::new();
    let first = fx.runtime.run_container("c1", &app(), "25%", "64M").unwrap();
    let first_pid = first.watch.pid();
    let _ = fx.runtime.stop_container("c1").unwrap();
    let _ = first.watch.wait().unwrap();

    let second = fx.runtime.start_container("c1").unwrap();
    assert_ne!(second.watch.pid(), first_pid);
    assert_eq!(second.record.status, ContainerStatus::Running);
    assert_eq!(second.record.exit_code, None);
    assert_eq!(second.record.ip_address(), Some("10.88.0.2"));
    assert_eq!(second.record.resources.cpu, "25%");
    assert_eq!(
        std::fs::read_to_string(fx.cgroup_dir("c1").join("cpu.max")).unwrap(),
        "25000 100000"
    );

    assert!(matches!(
        fx.runtime.start_container("c1"),
        Err(CarteError::InvalidState { operation: "start", .. })
    ));
    let _ = fx.runtime.stop_container("c1").unwrap();
    let _ = second.watch.wait().unwrap();
}

#[test]
fn concurrent_containers_get_distinct_addresses() {
    let fx = Fixture::new();
    let a = fx.runtime.run_container("a", &app(), "10%", "32M").unwrap();
    let b = fx.runtime.run_container("b", &app(), "10%", "32M").unwrap();
    assert_ne!(a.record.ip_address(), b.record.ip_address());
    assert!(a.record.ip_address().is_some());

    for (name, watch) in [("a", a.watch), ("b", b.watch)] {
        let _ = fx.runtime.stop_container(name).unwrap();
        let _ = watch.wait().unwrap();
    }
}

#[test]
fn exit_is_recorded_by_the_supervisor() {
    let fx = Fixture::new();
    let running = fx.runtime.run_container("c1", &app(), "50%", "100M").unwrap();
    let pid = running.watch.pid();

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(i32::try_from(pid).unwrap()),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();
    assert_eq!(running.watch.wait().unwrap(), ExitOutcome::Signaled(9));

    let record = &fx.runtime.list_containers().unwrap()[0];
    assert_eq!(record.status, ContainerStatus::Stopped);
    assert_eq!(record.exit_code, Some(137));
    assert_eq!(fx.network.detaches.load(Ordering::SeqCst), 1);
    assert!(matches!(
        fx.runtime.stop_container("c1"),
        Err(CarteError::InvalidState { operation: "stop", .. })
    ));
}

#[test]
fn stop_leaves_a_process_that_reused_the_pid_alone() {
    let fx = Fixture::new();
    let running = fx.runtime.run_container("c1", &app(), "50%", "100M").unwrap();
    let start_time = fx.record_json("c1")["pid_start_time"].clone();
    assert!(start_time.is_u64());
    let _ = fx.runtime.stop_container("c1").unwrap();
    let _ = running.watch.wait().unwrap();

    let mut bystander = Command::new("sleep").arg("30").spawn().unwrap();
    fx.mark_running_on_disk("c1", bystander.id(), &start_time);

    let stopped = fx.runtime.stop_container("c1").unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert_eq!(stopped.exit_code, None);
    assert_eq!(stopped.pid, None);
    assert!(bystander.try_wait().unwrap().is_none());

    bystander.kill().unwrap();
    let _ = bystander.wait().unwrap();
}

#[test]
fn stop_of_an_exited_detached_container_records_it_stopped() {
    let fx = Fixture::new();
    let running = fx.runtime.run_container("c1", &app(), "50%", "100M").unwrap();
    let start_time = fx.record_json("c1")["pid_start_time"].clone();
    let _ = fx.runtime.stop_container("c1").unwrap();
    let _ = running.watch.wait().unwrap();

    let mut gone = Command::new("true").spawn().unwrap();
    let _ = gone.wait().unwrap();
    fx.mark_running_on_disk("c1", gone.id(), &start_time);

    let stopped = fx.runtime.stop_container("c1").unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert_eq!(stopped.exit_code, None);
    fx.runtime.remove_container("c1").unwrap();
}

#[test]
fn list_settles_containers_whose_process_vanished() {
    let fx = Fixture::new();
    let running = fx.runtime.run_container("c1", &app(), "50%", "100M").unwrap();
    let start_time = fx.record_json("c1")["pid_start_time"].clone();
    let _ = fx.runtime.stop_container("c1").unwrap();
    let _ = running.watch.wait().unwrap();

    let mut bystander = Command::new("sleep").arg("30").spawn().unwrap();
    fx.mark_running_on_disk("c1", bystander.id(), &start_time);

    let list = fx.runtime.list_containers().unwrap();
    assert_eq!(list[0].status, ContainerStatus::Stopped);
    assert_eq!(list[0].pid, None);
    assert_eq!(fx.record_json("c1")["status"], "stopped");
    assert!(matches!(
        fx.runtime.stop_container("c1"),
        Err(CarteError::InvalidState { operation: "stop", .. })
    ));
    assert!(bystander.try_wait().unwrap().is_none());

    bystander.kill().unwrap();
    let _ = bystander.wait().unwrap();
}

#[test]
fn duplicate_name_and_bad_inputs_are_rejected() {
    let fx = Fixture::new();
    let running = fx.runtime.run_container("c1", &app(), "50%", "100M").unwrap();
    assert!(matches!(
        fx.runtime.run_container("c1", &app(), "50%", "100M"),
        Err(CarteError::AlreadyExists { .. })
    ));
    assert!(fx.runtime.run_container("c2", &app(), "0%", "100M").unwrap_err().is_validation());
    assert!(fx.runtime.run_container("c2", &app(), "50%", "lots").unwrap_err().is_validation());
    assert!(fx.runtime.run_container("../x", &app(), "50%", "100M").unwrap_err().is_validation());
    assert!(matches!(
        fx.runtime.run_container("c2", &ImageRef::new("nope", "latest"), "50%", "100M"),
        Err(CarteError::NotFound { kind: "image", .. })
    ));
    assert!(!fx.container_dir("c2").exists());

    let _ = fx.runtime.stop_container("c1").unwrap();
    let _ = running.watch.wait().unwrap();
}

#[test]
fn failed_network_attach_leaves_nothing_behind() {
    let fx = Fixture::with(HostSpawner::default(), true);
    assert!(matches!(
        fx.runtime.run_container("c1", &app(), "50%", "100M"),
        Err(CarteError::Network { .. })
    ));
    assert!(fx.runtime.list_containers().unwrap().is_empty());
    assert!(!fx.container_dir("c1").exists());
    assert_eq!(fx.network.attaches.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_spawn_writes_no_record() {
    let fx = Fixture::with(
        HostSpawner {
            fail_containers: true,
            ..HostSpawner::default()
        },
        false,
    );
    assert!(matches!(
        fx.runtime.run_container("c1", &app(), "50%", "100M"),
        Err(CarteError::Process { .. })
    ));
    assert!(fx.runtime.list_containers().unwrap().is_empty());
    assert!(!fx.container_dir("c1").exists());
    assert_eq!(fx.network.attaches.load(Ordering::SeqCst), 0);
}

#[test]
fn images_and_logs_are_listed() {
    let fx = Fixture::new();
    let images = fx.runtime.list_images().unwrap();
    let refs: Vec<_> = images.iter().map(|i| i.reference.as_str()).collect();
    assert_eq!(refs, ["app:latest", "base:latest"]);
    assert_eq!(images[0].layers, 4);
    assert_eq!(images[1].layers, 1);

    assert!(matches!(
        fx.runtime.container_logs("ghost"),
        Err(CarteError::NotFound { kind: "container", .. })
    ));
}
