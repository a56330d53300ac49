//! The spawn helper that runs between fork and exec.
//!
//! `wshd` execs this helper in the child; it applies the working
//! directory, rlimits, capability bounding set, and credentials, closes
//! every descriptor the process was not meant to inherit, and finally
//! execs the target argv (with PATH lookup for non-absolute paths).

use crate::SupervisorError;
use caps::{CapSet, Capability};
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{setgid, setgroups, setuid, Gid, Uid};
use std::ffi::CString;
use std::os::fd::RawFd;
use std::path::Path;

/// Everything the helper needs to start one process.
#[derive(Debug, Clone)]
pub struct StarterSpec {
    pub uid: u32,
    pub gid: u32,
    pub work_dir: Option<String>,
    /// Comma-separated `RLIMIT_<NAME>=<n>` pairs, as passed on the
    /// command line. Empty means no limits.
    pub rlimits: String,
    pub drop_capabilities: bool,
    pub argv: Vec<String>,
    /// Descriptors above stderr that must survive (the status fd).
    pub keep_fds: Vec<RawFd>,
}

/// Capabilities that survive the bounding-set drop. Everything else a
/// root-owned process could wield (module loading, raw I/O, ptrace,
/// clock and boot control) is cut off before exec.
pub const KEPT_CAPABILITIES: &[Capability] = &[
    Capability::CAP_CHOWN,
    Capability::CAP_DAC_OVERRIDE,
    Capability::CAP_FOWNER,
    Capability::CAP_FSETID,
    Capability::CAP_KILL,
    Capability::CAP_SETGID,
    Capability::CAP_SETUID,
    Capability::CAP_SETPCAP,
    Capability::CAP_NET_BIND_SERVICE,
    Capability::CAP_NET_RAW,
    Capability::CAP_SYS_CHROOT,
    Capability::CAP_MKNOD,
    Capability::CAP_AUDIT_WRITE,
    Capability::CAP_SETFCAP,
];

/// Parse `RLIMIT_NOFILE=2099,RLIMIT_CPU=3` into applicable limits.
pub fn parse_rlimits(spec: &str) -> Result<Vec<(Resource, u64)>, SupervisorError> {
    let mut limits = Vec::new();
    for entry in spec.split(',') {
        if entry.is_empty() {
            continue;
        }
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| SupervisorError::MalformedRlimit(entry.to_owned()))?;
        let value: u64 = value
            .parse()
            .map_err(|_| SupervisorError::MalformedRlimit(entry.to_owned()))?;
        let resource = resource_by_name(name)
            .ok_or_else(|| SupervisorError::UnknownRlimit(name.to_owned()))?;
        limits.push((resource, value));
    }
    Ok(limits)
}

fn resource_by_name(name: &str) -> Option<Resource> {
    match name {
        "RLIMIT_AS" => Some(Resource::RLIMIT_AS),
        "RLIMIT_CORE" => Some(Resource::RLIMIT_CORE),
        "RLIMIT_CPU" => Some(Resource::RLIMIT_CPU),
        "RLIMIT_DATA" => Some(Resource::RLIMIT_DATA),
        "RLIMIT_FSIZE" => Some(Resource::RLIMIT_FSIZE),
        "RLIMIT_LOCKS" => Some(Resource::RLIMIT_LOCKS),
        "RLIMIT_MEMLOCK" => Some(Resource::RLIMIT_MEMLOCK),
        "RLIMIT_MSGQUEUE" => Some(Resource::RLIMIT_MSGQUEUE),
        "RLIMIT_NICE" => Some(Resource::RLIMIT_NICE),
        "RLIMIT_NOFILE" => Some(Resource::RLIMIT_NOFILE),
        "RLIMIT_NPROC" => Some(Resource::RLIMIT_NPROC),
        "RLIMIT_RSS" => Some(Resource::RLIMIT_RSS),
        "RLIMIT_RTPRIO" => Some(Resource::RLIMIT_RTPRIO),
        "RLIMIT_SIGPENDING" => Some(Resource::RLIMIT_SIGPENDING),
        "RLIMIT_STACK" => Some(Resource::RLIMIT_STACK),
        _ => None,
    }
}

/// Resolve a user name to (uid, gid, home) from the container's passwd.
pub fn lookup_user(name: &str) -> Result<(u32, u32, String), SupervisorError> {
    lookup_user_in(name, "/etc/passwd")
}

fn lookup_user_in(name: &str, passwd_path: &str) -> Result<(u32, u32, String), SupervisorError> {
    let passwd = std::fs::read_to_string(passwd_path)?;
    for line in passwd.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 6 && fields[0] == name {
            let uid = fields[2]
                .parse()
                .map_err(|_| SupervisorError::UserNotFound(name.to_owned()))?;
            let gid = fields[3]
                .parse()
                .map_err(|_| SupervisorError::UserNotFound(name.to_owned()))?;
            return Ok((uid, gid, fields[5].to_owned()));
        }
    }
    Err(SupervisorError::UserNotFound(name.to_owned()))
}

/// Find the user name owning `uid`, then every group listing it as a
/// member. Falls back to the primary gid alone.
fn supplementary_groups(uid: u32, gid: u32) -> Vec<Gid> {
    let mut groups = vec![Gid::from_raw(gid)];

    let name = std::fs::read_to_string("/etc/passwd")
        .ok()
        .and_then(|passwd| {
            passwd.lines().find_map(|line| {
                let fields: Vec<&str> = line.split(':').collect();
                if fields.len() >= 3 && fields[2] == uid.to_string() {
                    Some(fields[0].to_owned())
                } else {
                    None
                }
            })
        });

    if let (Some(name), Ok(group_file)) = (name, std::fs::read_to_string("/etc/group")) {
        for line in group_file.lines() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() >= 4 && fields[3].split(',').any(|member| member == name) {
                if let Ok(gid) = fields[2].parse() {
                    groups.push(Gid::from_raw(gid));
                }
            }
        }
    }

    groups.dedup();
    groups
}

fn drop_capabilities() -> Result<(), SupervisorError> {
    for capability in caps::all() {
        if KEPT_CAPABILITIES.contains(&capability) {
            continue;
        }
        caps::drop(None, CapSet::Bounding, capability)
            .map_err(|e| SupervisorError::Capabilities(e.to_string()))?;
    }
    Ok(())
}

/// Close every descriptor above stderr except the kept ones, which are
/// marked close-on-exec instead: the status fd must stay writable until
/// exec but must vanish from the started process (its EOF is the
/// exec-succeeded signal).
fn close_unwanted_fds(keep: &[RawFd]) -> Result<(), SupervisorError> {
    let mut to_close = Vec::new();
    for entry in std::fs::read_dir("/proc/self/fd")? {
        let entry = entry?;
        if let Some(fd) = entry.file_name().to_str().and_then(|s| s.parse::<RawFd>().ok()) {
            if fd >= 3 && !keep.contains(&fd) {
                to_close.push(fd);
            }
        }
    }
    for fd in to_close {
        // One of these is the read_dir fd itself; already-closed is fine.
        let _ = nix::unistd::close(fd);
    }

    for fd in keep {
        let _ = nix::fcntl::fcntl(
            *fd,
            nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
        );
    }
    Ok(())
}

/// Prepare the process and exec. Only returns on failure.
pub fn start(spec: &StarterSpec) -> SupervisorError {
    match prepare_and_exec(spec) {
        Ok(never) => match never {},
        Err(e) => e,
    }
}

enum Never {}

fn prepare_and_exec(spec: &StarterSpec) -> Result<Never, SupervisorError> {
    if let Some(dir) = &spec.work_dir {
        if !Path::new(dir).is_dir() {
            return Err(SupervisorError::WorkingDirectoryMissing(dir.clone()));
        }
        nix::unistd::chdir(dir.as_str())?;
    }

    for (resource, value) in parse_rlimits(&spec.rlimits)? {
        setrlimit(resource, value, value)?;
    }

    if spec.drop_capabilities {
        drop_capabilities()?;
    }

    // Credential changes are skipped when they are no-ops, so an
    // unprivileged supervisor can still spawn as its own user.
    let uid = Uid::from_raw(spec.uid);
    let gid = Gid::from_raw(spec.gid);
    if nix::unistd::getgid() != gid || nix::unistd::getuid() != uid {
        setgroups(&supplementary_groups(spec.uid, spec.gid))?;
        setgid(gid)?;
        setuid(uid)?;
    }

    close_unwanted_fds(&spec.keep_fds)?;

    let program = CString::new(spec.argv[0].clone()).map_err(|_| {
        SupervisorError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "argv contains a NUL byte",
        ))
    })?;
    let argv: Vec<CString> = spec
        .argv
        .iter()
        .map(|arg| CString::new(arg.clone()))
        .collect::<Result<_, _>>()
        .map_err(|_| {
            SupervisorError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "argv contains a NUL byte",
            ))
        })?;

    if spec.argv[0].contains('/') {
        nix::unistd::execv(&program, &argv)?;
    } else {
        nix::unistd::execvp(&program, &argv)?;
    }
    unreachable!("exec returned without an error");
}
