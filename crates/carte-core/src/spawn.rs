//! Process spawning inside isolated namespaces.
//!
//! Spawning is two-phase. [`ProcessSpawner::spawn`] clones a child into
//! fresh namespaces and leaves it blocked on a sync pipe, so the caller can
//! attach networking, write cgroup limits, and map user IDs against a known
//! PID. [`PendingProcess::release`] then lets the child switch its root,
//! mount pseudo-filesystems, and exec the target program. Any failure in the
//! child is written to a close-on-exec error pipe; an empty read means the
//! exec succeeded.

use std::path::{Path, PathBuf};

use carte_common::config::RootStrategy;
use carte_common::error::{CarteError, Result};

use crate::namespace::NamespaceConfig;

/// Where the child's standard streams go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioMode {
    /// Share the caller's stdin, stdout, and stderr.
    Inherit,
    /// Append stdout and stderr to a file; stdin reads `/dev/null`.
    LogFile(PathBuf),
}

/// Everything needed to start a process in a container root.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Host path of the root filesystem.
    pub rootfs: PathBuf,
    /// Program and arguments; the program is resolved against `PATH`
    /// inside the new root when it contains no `/`.
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` strings.
    pub env: Vec<String>,
    /// Working directory inside the new root.
    pub workdir: String,
    /// Hostname set in the UTS namespace.
    pub hostname: String,
    /// Namespaces to create.
    pub namespaces: NamespaceConfig,
    /// How to switch into `rootfs`.
    pub root_strategy: RootStrategy,
    /// Standard stream handling.
    pub stdio: StdioMode,
}

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
}

impl ExitOutcome {
    /// Shell-style exit code: the status, or `128 + signal`.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => 128 + sig,
        }
    }

    /// Returns true for a zero exit status.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

/// Starts processes in isolated namespaces.
pub trait ProcessSpawner: Send + Sync {
    /// Creates the child and leaves it blocked before any setup.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or `clone(2)` fails.
    fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn PendingProcess>>;
}

/// A spawned child that has not yet been allowed to exec.
///
/// Dropping a pending process kills and reaps the child.
pub trait PendingProcess: Send {
    /// Host PID of the child.
    fn pid(&self) -> u32;

    /// Lets the child finish setup and exec its program.
    ///
    /// # Errors
    ///
    /// Returns the child's setup error; the child has been reaped by then.
    fn release(self: Box<Self>) -> Result<Box<dyn ContainerProcess>>;

    /// Kills and reaps the child without releasing it.
    fn abort(self: Box<Self>);
}

/// A running container process owned by this engine invocation.
pub trait ContainerProcess: Send {
    /// Host PID of the process.
    fn pid(&self) -> u32;

    /// Blocks until the process exits and reaps it.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails (e.g. the process was reaped elsewhere).
    fn wait(self: Box<Self>) -> Result<ExitOutcome>;
}

/// Result of signaling a recorded PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The signal was delivered.
    Delivered,
    /// No such process.
    Gone,
}

/// Returns true if `pid` exists and is not a zombie.
#[cfg(target_os = "linux")]
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(nix::unistd::Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Stub for non-Linux platforms.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| state == 'Z')
}

/// Kernel start time of `pid`, in clock ticks since boot.
///
/// A PID plus its start time names one process even after the PID is
/// reused. `None` once the process has been reaped.
#[cfg(target_os = "linux")]
#[must_use]
pub fn start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_start_time(&stat)
}

/// Stub for non-Linux platforms.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn start_time(_pid: u32) -> Option<u64> {
    None
}

/// Field 22 of a `/proc/<pid>/stat` line. `comm` may itself contain `)`.
#[cfg(target_os = "linux")]
fn parse_start_time(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// Sends `signal` to `pid`.
///
/// # Errors
///
/// Returns a process error if the signal is refused (e.g. `EPERM`).
#[cfg(target_os = "linux")]
pub fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<SignalOutcome> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let raw = i32::try_from(pid).map_err(|_| CarteError::Process {
        message: format!("pid {pid} out of range"),
    })?;
    match kill(nix::unistd::Pid::from_raw(raw), signal) {
        Ok(()) => {
            tracing::debug!(pid, signal = %signal, "signal delivered");
            Ok(SignalOutcome::Delivered)
        }
        Err(Errno::ESRCH) => Ok(SignalOutcome::Gone),
        Err(e) => Err(CarteError::Process {
            message: format!("failed to send {signal} to pid {pid}: {e}"),
        }),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns [`CarteError::Resource`].
#[cfg(not(target_os = "linux"))]
pub fn send_signal(_pid: u32, _signal: nix::sys::signal::Signal) -> Result<SignalOutcome> {
    Err(CarteError::Resource {
        message: "Linux required for native container operations".into(),
    })
}

/// Resolves a program name the way `execvp(3)` would, under `root`.
///
/// Names containing `/` are used as given.
///
/// # Errors
///
/// Returns a process error if no executable file matches.
pub fn resolve_program(root: &Path, program: &str, search_path: &str) -> Result<PathBuf> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| {
            let on_disk = root.join(candidate.strip_prefix("/").unwrap_or(candidate));
            on_disk.is_file()
        })
        .ok_or_else(|| CarteError::Process {
            message: format!("executable not found in PATH: {program}"),
        })
}

/// Extracts `PATH` from a `KEY=VALUE` environment, falling back to the default.
#[must_use]
pub fn search_path(env: &[String]) -> String {
    env.iter()
        .rev()
        .find_map(|kv| kv.strip_prefix("PATH="))
        .map_or_else(|| carte_common::constants::DEFAULT_PATH.to_string(), str::to_string)
}

#[cfg(target_os = "linux")]
pub use linux::NamespaceSpawner;

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
mod linux {
    use std::convert::Infallible;
    use std::ffi::CString;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, RawFd};
    use std::path::{Path, PathBuf};

    use nix::errno::Errno;
    use nix::fcntl::OFlag;
    use nix::sched::clone;
    use nix::sys::signal::{Signal, kill};
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{Pid, execve, pipe2};

    use carte_common::config::RootStrategy;
    use carte_common::error::{CarteError, Result};

    use super::{
        ContainerProcess, ExitOutcome, PendingProcess, ProcessSpawner, SpawnRequest, StdioMode,
    };
    use crate::filesystem::mount::{self, DeviceMode};
    use crate::filesystem::rootfs;
    use crate::namespace::{user, uts};

    const STACK_SIZE: usize = 1024 * 1024;

    /// Spawner backed by `clone(2)` with namespace flags.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NamespaceSpawner;

    impl NamespaceSpawner {
        /// Creates a new spawner.
        #[must_use]
        pub const fn new() -> Self {
            Self
        }
    }

    /// Child-side inputs, converted before `clone(2)` so the child does not
    /// need to allocate for them.
    struct ChildPlan {
        rootfs: PathBuf,
        workdir: PathBuf,
        hostname: String,
        strategy: RootStrategy,
        devices: DeviceMode,
        program: String,
        search_path: String,
        args: Vec<CString>,
        env: Vec<CString>,
        stdout: Option<File>,
        stdin: Option<File>,
    }

    impl ChildPlan {
        fn prepare(request: &SpawnRequest) -> Result<Self> {
            let program = request
                .args
                .first()
                .ok_or_else(|| CarteError::validation("no command to execute"))?
                .clone();
            if !request.rootfs.is_dir() {
                return Err(CarteError::NotFound {
                    kind: "root filesystem",
                    id: request.rootfs.display().to_string(),
                });
            }
            let (stdout, stdin) = match &request.stdio {
                StdioMode::Inherit => (None, None),
                StdioMode::LogFile(path) => {
                    let log = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map_err(|e| CarteError::io(path, e))?;
                    let null = File::open("/dev/null").map_err(|e| CarteError::io("/dev/null", e))?;
                    (Some(log), Some(null))
                }
            };
            Ok(Self {
                rootfs: request.rootfs.clone(),
                workdir: PathBuf::from(if request.workdir.is_empty() {
                    "/"
                } else {
                    request.workdir.as_str()
                }),
                hostname: request.hostname.clone(),
                strategy: request.root_strategy,
                devices: DeviceMode::for_user_namespace(request.namespaces.user),
                search_path: super::search_path(&request.env),
                program,
                args: to_cstrings(&request.args)?,
                env: to_cstrings(&request.env)?,
                stdout,
                stdin,
            })
        }
    }

    fn to_cstrings(values: &[String]) -> Result<Vec<CString>> {
        values
            .iter()
            .map(|v| {
                CString::new(v.as_bytes())
                    .map_err(|_| CarteError::validation(format!("value contains NUL byte: {v:?}")))
            })
            .collect()
    }

    impl ProcessSpawner for NamespaceSpawner {
        fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn PendingProcess>> {
            let plan = ChildPlan::prepare(request)?;
            let (sync_r, sync_w) = pipe2(OFlag::O_CLOEXEC).map_err(|e| process("sync pipe", e))?;
            let (err_r, err_w) = pipe2(OFlag::O_CLOEXEC).map_err(|e| process("error pipe", e))?;
            let fds = ChildFds {
                sync_r: sync_r.as_raw_fd(),
                sync_w: sync_w.as_raw_fd(),
                err_w: err_w.as_raw_fd(),
            };

            let mut stack = vec![0u8; STACK_SIZE];
            let flags = request.namespaces.clone_flags();
            let callback = Box::new(|| child_main(&plan, fds));
            // SAFETY: the child runs in its own copy of the address space
            // (no CLONE_VM), so `stack` and `plan` are private to it; the
            // callback only uses async-signal-tolerant syscalls before exec.
            let pid = unsafe { clone(callback, &mut stack, flags, Some(libc::SIGCHLD)) }
                .map_err(|e| process("clone", e))?;
            drop(sync_r);
            drop(err_w);

            let pending = NamespacePending {
                pid,
                sync: Some(File::from(sync_w)),
                errors: File::from(err_r),
                released: false,
            };
            if request.namespaces.user {
                user::write_id_maps(
                    pending.pid(),
                    nix::unistd::getuid().as_raw(),
                    nix::unistd::getgid().as_raw(),
                )?;
            }
            tracing::info!(pid = pid.as_raw(), rootfs = %request.rootfs.display(), "container process cloned");
            Ok(Box::new(pending))
        }
    }

    #[derive(Clone, Copy)]
    struct ChildFds {
        sync_r: RawFd,
        sync_w: RawFd,
        err_w: RawFd,
    }

    fn child_main(plan: &ChildPlan, fds: ChildFds) -> isize {
        // SAFETY: the descriptors were inherited across clone and this
        // child holds the only references to its copies.
        let (mut sync, sync_w, mut errors) = unsafe {
            (
                File::from_raw_fd(fds.sync_r),
                File::from_raw_fd(fds.sync_w),
                File::from_raw_fd(fds.err_w),
            )
        };
        drop(sync_w);
        let mut byte = [0u8; 1];
        if !matches!(sync.read(&mut byte), Ok(1)) {
            return 1;
        }
        drop(sync);

        match setup_and_exec(plan) {
            Ok(never) => match never {},
            Err(e) => {
                let _ = errors.write_all(e.to_string().as_bytes());
                127
            }
        }
    }

    fn setup_and_exec(plan: &ChildPlan) -> Result<Infallible> {
        uts::set_hostname(&plan.hostname)?;
        rootfs::make_mounts_private()?;
        if plan.devices == DeviceMode::BindHost {
            mount::populate_dev(&plan.rootfs.join("dev"), DeviceMode::BindHost)?;
        }
        rootfs::switch_root(&plan.rootfs, plan.strategy)?;
        mount::mount_pseudo_filesystems(plan.devices)?;
        nix::unistd::chdir(&plan.workdir).map_err(|e| CarteError::Resource {
            message: format!("chdir {} failed: {e}", plan.workdir.display()),
        })?;
        redirect_stdio(plan)?;

        let program = super::resolve_program(Path::new("/"), &plan.program, &plan.search_path)?;
        let program = CString::new(program.as_os_str().as_encoded_bytes())
            .map_err(|_| CarteError::validation("program path contains NUL byte"))?;
        execve(&program, &plan.args, &plan.env).map_err(|e| CarteError::Process {
            message: format!("exec {} failed: {e}", plan.program),
        })
    }

    fn redirect_stdio(plan: &ChildPlan) -> Result<()> {
        let targets = [
            (plan.stdin.as_ref(), libc::STDIN_FILENO),
            (plan.stdout.as_ref(), libc::STDOUT_FILENO),
            (plan.stdout.as_ref(), libc::STDERR_FILENO),
        ];
        for (file, target) in targets {
            if let Some(file) = file {
                // SAFETY: both descriptors are open in this process; dup2
                // atomically replaces `target`.
                if unsafe { libc::dup2(file.as_raw_fd(), target) } < 0 {
                    return Err(process("dup2", Errno::last()));
                }
            }
        }
        Ok(())
    }

    struct NamespacePending {
        pid: Pid,
        sync: Option<File>,
        errors: File,
        released: bool,
    }

    impl PendingProcess for NamespacePending {
        fn pid(&self) -> u32 {
            self.pid.as_raw().unsigned_abs()
        }

        fn release(mut self: Box<Self>) -> Result<Box<dyn ContainerProcess>> {
            let delivered = self
                .sync
                .take()
                .is_some_and(|mut sync| sync.write_all(&[1]).is_ok());
            let mut report = String::new();
            let read = self.errors.read_to_string(&mut report);
            self.released = true;

            if !report.is_empty() {
                reap(self.pid);
                return Err(CarteError::Process {
                    message: format!("container init failed: {report}"),
                });
            }
            if !delivered || read.is_err() {
                reap(self.pid);
                return Err(CarteError::Process {
                    message: "container init exited before release".into(),
                });
            }
            tracing::debug!(pid = self.pid.as_raw(), "container process released");
            Ok(Box::new(NamespaceProcess { pid: self.pid }))
        }

        fn abort(self: Box<Self>) {
            drop(self);
        }
    }

    impl Drop for NamespacePending {
        fn drop(&mut self) {
            if !self.released {
                tracing::debug!(pid = self.pid.as_raw(), "aborting unreleased container process");
                reap(self.pid);
            }
        }
    }

    struct NamespaceProcess {
        pid: Pid,
    }

    impl ContainerProcess for NamespaceProcess {
        fn pid(&self) -> u32 {
            self.pid.as_raw().unsigned_abs()
        }

        fn wait(self: Box<Self>) -> Result<ExitOutcome> {
            wait_for(self.pid)
        }
    }

    fn wait_for(pid: Pid) -> Result<ExitOutcome> {
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ExitOutcome::Exited(code)),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return Ok(ExitOutcome::Signaled(signal as i32));
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(process("waitpid", e)),
            }
        }
    }

    fn reap(pid: Pid) {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = wait_for(pid);
    }

    fn process(step: &str, err: Errno) -> CarteError {
        CarteError::Process {
            message: format!("{step} failed: {err}"),
        }
    }

}
