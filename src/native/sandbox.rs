//! Process level confinement for learner programs.
//!
//! Learner code gets kernel resource limits, its own process group, and
//! (on Linux) private mount and network namespaces in which everything but
//! the scratch directory is read-only and no network is reachable.

use std::ffi::CString;
use std::io;
use std::path::Path;

use crate::core::domain::ExecutionLimits;

const FILE_SIZE_LIMIT_BYTES: u64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Isolation {
    /// Refuse to run code when private mount and network namespaces can't be created.
    #[default]
    Required,
    /// Use private namespaces when the host allows them, and run unconfined otherwise.
    BestEffort,
    Disabled,
}

/// Kernel resource limits applied to the child before it starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    pub address_space_bytes: u64,
    pub cpu_seconds: u64,
    pub file_size_bytes: u64,
}

impl ResourceLimits {
    /// The CPU limit only backs up the wall-clock deadline, so it is rounded
    /// up and padded by a second.
    pub fn from_execution(limits: &ExecutionLimits) -> Self {
        Self {
            address_space_bytes: limits.memory_bytes,
            cpu_seconds: limits.time_ms.div_ceil(1000) + 1,
            file_size_bytes: FILE_SIZE_LIMIT_BYTES,
        }
    }
}

/// Everything a child needs to confine itself. Built in the parent so the
/// `pre_exec` hook never allocates.
#[derive(Clone, Debug)]
pub struct Confinement {
    limits: ResourceLimits,
    isolation: Isolation,
    scratch: CString,
}

impl Confinement {
    pub fn new(limits: ResourceLimits, isolation: Isolation, scratch: &Path) -> io::Result<Self> {
        use std::os::unix::ffi::OsStrExt;

        let scratch = CString::new(scratch.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(Self {
            limits,
            isolation,
            scratch,
        })
    }

    /// Runs in the forked child right before `exec`. Only async-signal-safe
    /// calls are allowed here.
    pub fn apply(&self) -> io::Result<()> {
        let limits = &self.limits;
        lower_limit(
            libc::RLIMIT_AS,
            limits.address_space_bytes,
            limits.address_space_bytes,
        )?;
        // SIGXCPU at the soft limit, SIGKILL one second later.
        lower_limit(libc::RLIMIT_CPU, limits.cpu_seconds, limits.cpu_seconds + 1)?;
        lower_limit(libc::RLIMIT_FSIZE, limits.file_size_bytes, limits.file_size_bytes)?;
        lower_limit(libc::RLIMIT_CORE, 0, 0)?;

        match self.isolation {
            Isolation::Disabled => Ok(()),
            Isolation::BestEffort => {
                // Checked once at startup, where a failure is reported.
                let _ = isolate(&self.scratch);
                Ok(())
            }
            Isolation::Required => isolate(&self.scratch),
        }
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RlimitResource = libc::c_int;

/// Lowers a limit, never above the current hard limit.
fn lower_limit(resource: RlimitResource, soft: u64, hard: u64) -> io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: plain syscalls on a stack value.
    unsafe {
        if libc::getrlimit(resource, &mut current) != 0 {
            return Err(io::Error::last_os_error());
        }
        let max = current.rlim_max;
        let limit = libc::rlimit {
            rlim_cur: (soft as libc::rlim_t).min(max),
            rlim_max: (hard as libc::rlim_t).min(max),
        };
        if libc::setrlimit(resource, &limit) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn cvt(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(target_os = "linux")]
const MOUNT_ATTR_RDONLY: u64 = 0x1;

/// `struct mount_attr` from `<linux/mount.h>`.
#[cfg(target_os = "linux")]
#[repr(C)]
struct MountAttr {
    attr_set: u64,
    attr_clr: u64,
    propagation: u64,
    userns_fd: u64,
}

#[cfg(target_os = "linux")]
fn set_mount_attr(path: &std::ffi::CStr, flags: libc::c_uint, set: u64, clear: u64) -> io::Result<()> {
    let attr = MountAttr {
        attr_set: set,
        attr_clr: clear,
        propagation: 0,
        userns_fd: 0,
    };
    // SAFETY: both pointers outlive the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mount_setattr,
            libc::AT_FDCWD,
            path.as_ptr(),
            flags,
            &attr as *const MountAttr,
            std::mem::size_of::<MountAttr>(),
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Moves the child into fresh mount and network namespaces, then remounts
/// every filesystem read-only except a bind mount of `scratch`, which
/// becomes the working directory.
#[cfg(target_os = "linux")]
fn isolate(scratch: &std::ffi::CStr) -> io::Result<()> {
    const NAMESPACES: libc::c_int = libc::CLONE_NEWNS | libc::CLONE_NEWNET;

    // SAFETY: unshare and mount only affect the calling (single threaded)
    // child, and every pointer refers to a live C string.
    unsafe {
        // Unprivileged hosts need a user namespace to own the others.
        if libc::unshare(NAMESPACES) != 0 {
            cvt(libc::unshare(libc::CLONE_NEWUSER | NAMESPACES))?;
        }
        // Nothing below may propagate back to the host.
        cvt(libc::mount(
            std::ptr::null(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        ))?;
        cvt(libc::mount(
            scratch.as_ptr(),
            scratch.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND,
            std::ptr::null(),
        ))?;
    }
    set_mount_attr(c"/", libc::AT_RECURSIVE as libc::c_uint, MOUNT_ATTR_RDONLY, 0)?;
    set_mount_attr(scratch, 0, 0, MOUNT_ATTR_RDONLY)?;
    // The working directory was entered before the bind mount covered it.
    // SAFETY: `scratch` is a live C string.
    cvt(unsafe { libc::chdir(scratch.as_ptr()) })
}

#[cfg(not(target_os = "linux"))]
fn isolate(_scratch: &std::ffi::CStr) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "mount and network namespaces are only available on Linux",
    ))
}

/// The process group of a sandboxed child. Dropping it kills the whole group,
/// so grandchildren can't outlive the run.
///
/// The group id equals the leader's pid, which stays reserved only while the
/// leader is unreaped. The leader is therefore watched with `WNOWAIT` and the
/// group is killed before the leader is reaped.
#[derive(Debug)]
pub struct ProcessGroup {
    leader: Option<libc::pid_t>,
}

impl ProcessGroup {
    /// `leader` is the pid of a child spawned as the leader of its own group.
    pub fn new(leader: Option<u32>) -> Self {
        Self {
            leader: leader.and_then(|pid| libc::pid_t::try_from(pid).ok()),
        }
    }

    /// Whether the leader has exited, leaving it unreaped.
    pub fn leader_exited(&self) -> io::Result<bool> {
        let Some(pid) = self.leader else {
            return Ok(true);
        };
        // SAFETY: `info` is a zeroed stack value the kernel fills in.
        unsafe {
            let mut info: libc::siginfo_t = std::mem::zeroed();
            let rc = libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            );
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(info.si_pid() != 0)
        }
    }

    pub fn kill(&self) {
        if let Some(pgid) = self.leader {
            // SAFETY: signalling a process group we created; ESRCH is fine.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }

    /// Forgets the group once its leader has been reaped and the id may be reused.
    pub fn release(&mut self) {
        self.leader = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Collects stdout and stderr under one combined byte budget.
#[derive(Debug)]
pub struct OutputCapture {
    limit: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated: bool,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            stdout: Vec::new(),
            stderr: Vec::new(),
            truncated: false,
        }
    }

    fn used(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }

    /// Stores as much of `chunk` as fits. Returns `false` once the budget is exceeded.
    pub fn push(&mut self, stream: Stream, chunk: &[u8]) -> bool {
        let room = self.limit.saturating_sub(self.used());
        let kept = chunk.len().min(room);
        let buf = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        buf.extend_from_slice(&chunk[..kept]);

        if kept < chunk.len() {
            self.truncated = true;
        }
        !self.truncated
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Decoded output. Invalid UTF-8 is replaced, and the combined length of
    /// both strings never exceeds the budget.
    pub fn into_strings(self) -> (String, String) {
        let stdout = decode(&self.stdout);
        let stderr = decode(&self.stderr);
        (stdout, stderr)
    }
}

/// Lossy decoding, cut back to the raw byte length so replacement
/// characters can't grow the text.
fn decode(bytes: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() > bytes.len() {
        let mut end = bytes.len();
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
