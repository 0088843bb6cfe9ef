//! Cross-process coordination primitives.
//!
//! PID liveness checks, pid/refs file IO, and the signal escalation used to
//! stop the engine. These back the on-disk lease in `engine::lease`.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

/// Check whether a process exists.
pub fn pid_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        // Signal 0 probes for existence without delivering anything.
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to another user.
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Read a PID from a text file.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|&pid| pid > 0)
}

/// Write a PID to a text file.
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    fs::write(path, format!("{}\n", pid))
}

/// Read the JSON array of client PIDs holding a lease.
pub fn read_ref_pids(path: &Path) -> Vec<u32> {
    match fs::read_to_string(path) {
        Ok(content) if !content.is_empty() => {
            serde_json::from_str::<Vec<u32>>(&content).unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

/// Persist the lease-holder PIDs. An empty set deletes the file.
pub fn write_ref_pids(path: &Path, pids: &[u32]) -> io::Result<()> {
    let mut unique: Vec<u32> = Vec::new();
    for &pid in pids {
        if pid > 0 && !unique.contains(&pid) {
            unique.push(pid);
        }
    }

    if unique.is_empty() {
        let _ = fs::remove_file(path);
        return Ok(());
    }

    // Write-then-rename keeps concurrent readers from seeing a torn file.
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, serde_json::to_string(&unique)?)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Keep only PIDs belonging to live processes.
pub fn filter_alive_pids(pids: &[u32]) -> Vec<u32> {
    pids.iter().copied().filter(|&pid| pid_is_alive(pid)).collect()
}

/// Stop the engine: SIGINT, then SIGTERM, then SIGKILL, each after
/// `escalation_timeout` without an exit. Returns true once the process is
/// gone.
#[cfg(unix)]
pub fn stop_engine_process(pid: u32, escalation_timeout: Duration) -> bool {
    use libc::{SIGINT, SIGKILL, SIGTERM};

    for (signal, name) in [(SIGINT, "SIGINT"), (SIGTERM, "SIGTERM")] {
        if unsafe { libc::kill(pid as libc::pid_t, signal) } != 0 {
            return !pid_is_alive(pid);
        }
        if wait_for_exit(pid, escalation_timeout) {
            return true;
        }
        log::warn!("engine {} did not exit after {}", pid, name);
    }

    unsafe { libc::kill(pid as libc::pid_t, SIGKILL) };
    wait_for_exit(pid, Duration::from_secs(5))
}

#[cfg(not(unix))]
pub fn stop_engine_process(_pid: u32, _escalation_timeout: Duration) -> bool {
    false
}

/// Poll until a process exits or the deadline passes, reaping it when it is
/// our child.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return true;
        }

        #[cfg(unix)]
        {
            let result = unsafe {
                let mut status: libc::c_int = 0;
                libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG)
            };
            if result == pid as libc::pid_t {
                return true;
            }
        }

        std::thread::sleep(Duration::from_millis(50));
    }

    !pid_is_alive(pid)
}

/// Blocking reap of a child process.
#[cfg(unix)]
pub fn reap_engine_process(pid: u32) {
    loop {
        let result = unsafe {
            let mut status: libc::c_int = 0;
            libc::waitpid(pid as libc::pid_t, &mut status, 0)
        };
        if result >= 0 {
            break;
        }
        match io::Error::last_os_error().raw_os_error() {
            Some(errno) if errno == libc::EINTR => continue,
            _ => break, // ECHILD: not our child, nothing to reap
        }
    }
}

#[cfg(not(unix))]
pub fn reap_engine_process(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(pid_is_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!pid_is_alive(0));
    }

    #[test]
    fn pid_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.pid");

        write_pid_file(&path, 1234).unwrap();
        assert_eq!(read_pid_file(&path), Some(1234));
    }

    #[test]
    fn garbage_pid_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.pid");
        std::fs::write(&path, "not-a-pid\n").unwrap();
        assert_eq!(read_pid_file(&path), None);
    }

    #[test]
    fn ref_pids_round_trip_and_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.refs");

        write_ref_pids(&path, &[1234, 5678, 1234, 0]).unwrap();
        assert_eq!(read_ref_pids(&path), vec![1234, 5678]);
    }

    #[test]
    fn empty_ref_pids_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.refs");

        write_ref_pids(&path, &[42]).unwrap();
        assert!(path.exists());

        write_ref_pids(&path, &[]).unwrap();
        assert!(!path.exists());
        assert!(read_ref_pids(&path).is_empty());
    }

    #[test]
    fn filter_drops_dead_pids() {
        let current = std::process::id();
        let alive = filter_alive_pids(&[current, 999_999_999]);
        assert_eq!(alive, vec![current]);
    }
}
