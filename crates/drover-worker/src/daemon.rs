//! Process detachment, pidfile handling and redeploy re-exec.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process;

use nix::sys::stat::{umask, Mode};
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("daemon never reported its pid")]
    NoPidReported,
}

/// Deletes the pidfile at drop, but only in the process that recorded its
/// pid there. Forked descendants inherit the guard and must not remove the
/// file.
pub struct PidfileGuard {
    path: PathBuf,
    owner: i32,
}

impl PidfileGuard {
    pub fn new(path: PathBuf, owner: i32) -> Self {
        PidfileGuard { path, owner }
    }
}

impl Drop for PidfileGuard {
    fn drop(&mut self) {
        if unistd::getpid().as_raw() == self.owner {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Fork the current process into a detached background daemon running
/// `work`, and return in the launching process once the daemon is
/// confirmed running.
///
/// The daemon's pid travels back through a pipe, and the launcher writes
/// the pidfile only after reading it, so the pidfile is either absent or
/// holds a live pid; it is never partial and never inferred from fork
/// return values. The daemon itself removes the file when `work` returns.
pub fn detach(pidfile: &Path, work: impl FnOnce()) -> Result<(), DaemonError> {
    let (read_end, write_end) = unistd::pipe()?;

    match unsafe { unistd::fork()? } {
        ForkResult::Parent { child } => {
            drop(write_end);
            let mut reported = String::new();
            File::from(read_end).read_to_string(&mut reported)?;
            let pid: i32 = reported.trim().parse().map_err(|_| DaemonError::NoPidReported)?;
            fs::write(pidfile, pid.to_string())?;
            // The intermediate child exits as soon as it has forked again.
            let _ = waitpid(child, None);
            Ok(())
        }
        ForkResult::Child => {
            drop(read_end);

            // A freshly forked process is never a session leader, so this
            // only fails if the OS is badly broken.
            if unistd::setsid().is_err() {
                eprintln!("drover: failed to detach from controlling terminal");
                process::exit(1);
            }

            // Fork again and let the session leader die; the grandchild is
            // orphaned, with no way to reacquire a controlling terminal.
            match unsafe { unistd::fork() } {
                Ok(ForkResult::Parent { .. }) => process::exit(0),
                Ok(ForkResult::Child) => {
                    let pid = unistd::getpid().as_raw();

                    // Confirm startup to the launcher before anything else.
                    let mut pipe = File::from(write_end);
                    let _ = pipe.write_all(pid.to_string().as_bytes());
                    drop(pipe);

                    let _guard = PidfileGuard::new(pidfile.to_path_buf(), pid);
                    umask(Mode::empty());
                    if let Err(err) = redirect_stdio() {
                        eprintln!("drover: failed to redirect stdio: {err}");
                    }

                    work();
                    drop(_guard);
                    process::exit(0);
                }
                Err(_) => process::exit(1),
            }
        }
    }
}

fn redirect_stdio() -> Result<(), DaemonError> {
    let stdin = File::open("/dev/null")?;
    let stdout = OpenOptions::new().append(true).open("/dev/null")?;
    unistd::dup2(stdin.as_raw_fd(), 0)?;
    unistd::dup2(stdout.as_raw_fd(), 1)?;
    unistd::dup2(1, 2)?;
    Ok(())
}

/// Where the redeploy symlink points now, when that differs from the
/// current working directory. `None` means no new deployment.
pub fn redeploy_target(link: &Path) -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    resolve_redeploy(link, &cwd)
}

fn resolve_redeploy(link: &Path, cwd: &Path) -> Option<PathBuf> {
    let target = fs::canonicalize(link).ok()?;
    if target != cwd && target.is_dir() {
        Some(target)
    } else {
        None
    }
}

/// Replace this process with the binary it was invoked as, started from
/// `dir`, with identical arguments. Only returns on failure.
///
/// The invocation path is re-resolved rather than the running image: a
/// worker launched as `bin/drover` through a deployment symlink must pick
/// up `dir`'s copy of that binary, so the chdir happens before the path
/// lookup. Resolving the running executable would point back into the old
/// deployment and re-exec the code we are trying to leave.
pub fn reexec(dir: &Path) -> std::io::Error {
    use std::os::unix::process::CommandExt;

    let mut args = std::env::args_os();
    let argv0 = args.next().unwrap_or_default();
    process::Command::new(reexec_program(&argv0))
        .args(args)
        .current_dir(dir)
        .exec()
}

/// A relative invocation path is kept relative so it resolves against the
/// new working directory at exec time.
fn reexec_program(argv0: &std::ffi::OsStr) -> PathBuf {
    if argv0.is_empty() {
        std::env::current_exe().unwrap_or_else(|_| PathBuf::from("drover"))
    } else {
        PathBuf::from(argv0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_guard_removes_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.pid");
        let me = unistd::getpid().as_raw();
        fs::write(&path, me.to_string()).unwrap();

        drop(PidfileGuard::new(path.clone(), me));
        assert!(!path.exists());
    }

    #[test]
    fn pidfile_guard_spares_anothers_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.pid");
        let me = unistd::getpid().as_raw();
        fs::write(&path, "1").unwrap();

        // A forked child would see its own pid differ from the owner.
        drop(PidfileGuard::new(path.clone(), me + 1));
        assert!(path.exists());
    }

    #[test]
    fn redeploy_detected_when_symlink_moves() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("v1")).unwrap();
        fs::create_dir(dir.path().join("v2")).unwrap();
        let old = fs::canonicalize(dir.path().join("v1")).unwrap();
        let link = dir.path().join("current");
        std::os::unix::fs::symlink(dir.path().join("v2"), &link).unwrap();

        let target = resolve_redeploy(&link, &old).unwrap();
        assert_eq!(target, fs::canonicalize(dir.path().join("v2")).unwrap());
    }

    #[test]
    fn no_redeploy_when_symlink_matches_cwd() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("v1")).unwrap();
        let cwd = fs::canonicalize(dir.path().join("v1")).unwrap();
        let link = dir.path().join("current");
        std::os::unix::fs::symlink(&cwd, &link).unwrap();

        assert!(resolve_redeploy(&link, &cwd).is_none());
    }

    #[test]
    fn reexec_runs_the_binary_from_the_new_deployment() {
        let program = reexec_program(std::ffi::OsStr::new("bin/drover"));
        assert_eq!(program, PathBuf::from("bin/drover"));

        // Resolved against the working directory at exec time, the same
        // invocation names a different binary per deployment.
        assert_eq!(
            Path::new("/app/releases/v1").join(&program),
            PathBuf::from("/app/releases/v1/bin/drover")
        );
        assert_eq!(
            Path::new("/app/releases/v2").join(&program),
            PathBuf::from("/app/releases/v2/bin/drover")
        );
    }

    #[test]
    fn reexec_absolute_invocation_is_kept() {
        let program = reexec_program(std::ffi::OsStr::new("/usr/local/bin/drover"));
        assert_eq!(program, PathBuf::from("/usr/local/bin/drover"));
    }

    #[test]
    fn reexec_falls_back_when_argv0_is_missing() {
        let program = reexec_program(std::ffi::OsStr::new(""));
        assert!(!program.as_os_str().is_empty());
    }

    #[test]
    fn dangling_symlink_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("current");
        std::os::unix::fs::symlink(dir.path().join("gone"), &link).unwrap();

        assert!(resolve_redeploy(&link, dir.path()).is_none());
    }
}
