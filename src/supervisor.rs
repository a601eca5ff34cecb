// Copyright 2023 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Child-process supervision.
//!
//! Optional services run as forked children under an unprivileged
//! uid/gid, each connected to the agent by a socketpair used for
//! subprocess RPCs.  The supervisor's reap loop treats the death of any
//! child as fatal: remaining children get SIGTERM and the agent then
//! raises SIGTERM on itself so normal teardown runs.

use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, raise, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, getuid, pipe, read, setgid, setuid, ForkResult,
                  Gid, Pid, Uid};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex};

use crate::ipc::{NotifyLevel, SourceType};

/// How a spawned child starts: exec a command line, or run an in-process
/// entry point (which receives its end of the socketpair).
pub enum ChildEntry {
    Exec(Vec<String>),
    Func(fn(RawFd) -> i32),
}

struct ChildProc {
    name: String,
    tag: SourceType,
    pid: Pid,
    pipe: RawFd,
}

#[derive(Default)]
pub struct Supervisor {
    children: Mutex<Vec<ChildProc>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fork a supervised child.  The child drops to `uid`/`gid` (when the
    /// agent runs as root), arranges to die with its parent, and then
    /// either execs or calls the entry function.
    pub fn spawn(
        &self,
        name: &str,
        tag: SourceType,
        uid: u32,
        gid: u32,
        entry: ChildEntry,
    ) -> Result<()> {
        let (parent_fd, child_fd) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .context("creating child socketpair")?;

        match unsafe { fork() }.context("forking child process")? {
            ForkResult::Parent { child } => {
                let _ = close(child_fd);
                log::trace!("started {name} with pid {child} and fd {parent_fd}");
                self.children.lock().unwrap().push(ChildProc {
                    name: name.to_string(),
                    tag,
                    pid: child,
                    pipe: parent_fd,
                });
                Ok(())
            }
            ForkResult::Child => {
                let _ = close(parent_fd);
                // die with the parent instead of lingering orphaned
                unsafe {
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM, 0, 0, 0);
                }
                if getuid().is_root() {
                    if setgid(Gid::from_raw(gid)).is_err() || setuid(Uid::from_raw(uid)).is_err()
                    {
                        log::error!("cannot drop privileges for {name}");
                        std::process::exit(1);
                    }
                }
                match entry {
                    ChildEntry::Func(f) => std::process::exit(f(child_fd)),
                    ChildEntry::Exec(args) => {
                        let cargs: Vec<CString> = args
                            .iter()
                            .map(|a| CString::new(a.as_str()).unwrap())
                            .collect();
                        let _ = execvp(cargs[0].as_c_str(), &cargs);
                        std::process::exit(127);
                    }
                }
            }
        }
    }

    /// RPC pipe of the child registered under `tag`.
    pub fn pipe_for(&self, tag: SourceType) -> Option<RawFd> {
        self.children
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.tag == tag)
            .map(|c| c.pipe)
    }

    pub fn name_for(&self, tag: SourceType) -> String {
        self.children
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.tag == tag)
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }

    pub fn has_children(&self) -> bool {
        !self.children.lock().unwrap().is_empty()
    }

    /// Reap children until one dies, then terminate the others and raise
    /// SIGTERM on the agent itself.  Returns once termination has been
    /// initiated.
    pub fn run_reaper(&self) {
        loop {
            match waitpid(None, None) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    if self.handle_death(pid, &format!("exited, status={code}")) {
                        return;
                    }
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    if self.handle_death(pid, &format!("killed by signal {signal:?}")) {
                        return;
                    }
                }
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => return,
                Err(e) => {
                    log::error!("waitpid failed: {e}");
                    return;
                }
            }
        }
    }

    fn handle_death(&self, pid: Pid, cause: &str) -> bool {
        let children = self.children.lock().unwrap();
        let dead = match children.iter().find(|c| c.pid == pid) {
            Some(child) => child,
            None => return false,
        };
        log::error!("child {} ({}) {}", dead.pid, dead.name, cause);
        for child in children.iter() {
            if child.pid != pid {
                let _ = kill(child.pid, Signal::SIGTERM);
            }
        }
        // raise instead of exit so teardown handlers run
        let _ = raise(Signal::SIGTERM);
        true
    }
}

/// Barrier gating subprocess start on service threads being ready.
#[derive(Default)]
pub struct ReadyBarrier {
    pending: Mutex<usize>,
    cond: Condvar,
}

impl ReadyBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one thread that must signal readiness.
    pub fn register(&self) {
        *self.pending.lock().unwrap() += 1;
    }

    /// Signal that the calling thread is in place.
    pub fn ready(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until every registered thread has signalled.
    pub fn wait_all_ready(&self) {
        let mut pending = self.pending.lock().unwrap();
        while *pending != 0 {
            pending = self.cond.wait(pending).unwrap();
        }
    }
}

const STDOUT_PIPE: usize = 0;
const STDERR_PIPE: usize = 1;
const INFO_PIPE: usize = 2;
const WARN_PIPE: usize = 3;

/// Run a helper command in a short-lived child, forwarding its output as
/// notifications: stdout at trace level, stderr at error level, plus two
/// extra descriptors (3 and 4, advertised through `UPDATE_INFO_FD` and
/// `UPDATE_WARN_FD`) for info and warn lines.  Returns the exit status.
pub fn run_command(cmdline: &str) -> Result<i32> {
    if cmdline.trim().is_empty() {
        return Ok(0);
    }

    let mut pipes = Vec::with_capacity(4);
    for _ in 0..4 {
        pipes.push(pipe().context("creating output pipes")?);
    }

    match unsafe { fork() }.context("forking helper process")? {
        ForkResult::Child => {
            let setup = || -> nix::Result<()> {
                dup2(pipes[STDOUT_PIPE].1, libc::STDOUT_FILENO)?;
                dup2(pipes[STDERR_PIPE].1, libc::STDERR_FILENO)?;
                // POSIX sh cannot address fds >= 10, keep these low
                dup2(pipes[INFO_PIPE].1, 3)?;
                dup2(pipes[WARN_PIPE].1, 4)?;
                Ok(())
            };
            if setup().is_err() {
                std::process::exit(126);
            }
            std::env::set_var("UPDATE_INFO_FD", "3");
            std::env::set_var("UPDATE_WARN_FD", "4");
            for (r, w) in &pipes {
                let _ = close(*r);
                if *w > 4 {
                    let _ = close(*w);
                }
            }
            let argv = [
                CString::new("sh").unwrap(),
                CString::new("-c").unwrap(),
                CString::new(cmdline).unwrap(),
            ];
            let _ = execvp(CString::new("/bin/sh").unwrap().as_c_str(), &argv);
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            for (_, w) in &pipes {
                let _ = close(*w);
            }
            let levels = [
                NotifyLevel::Trace,
                NotifyLevel::Error,
                NotifyLevel::Info,
                NotifyLevel::Warn,
            ];
            let mut fds: Vec<Option<RawFd>> =
                pipes.iter().map(|(r, _)| Some(*r)).collect();
            let mut lines: Vec<Vec<u8>> = vec![Vec::new(); 4];

            while fds.iter().any(|fd| fd.is_some()) {
                let mut pollfds: Vec<PollFd> = Vec::new();
                let mut index = Vec::new();
                for (i, fd) in fds.iter().enumerate() {
                    if let Some(fd) = fd {
                        pollfds.push(PollFd::new(*fd, PollFlags::POLLIN));
                        index.push(i);
                    }
                }
                match poll(&mut pollfds, 1000) {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(anyhow!("polling helper output: {e}")),
                }
                let ready: Vec<usize> = pollfds
                    .iter()
                    .zip(&index)
                    .filter(|(p, _)| p.revents().map_or(false, |r| !r.is_empty()))
                    .map(|(_, i)| *i)
                    .collect();
                for i in ready {
                    let fd = fds[i].unwrap();
                    let mut buf = [0u8; 1024];
                    match read(fd, &mut buf) {
                        Ok(0) | Err(_) => {
                            emit_line(levels[i], &lines[i]);
                            lines[i].clear();
                            let _ = close(fd);
                            fds[i] = None;
                        }
                        Ok(n) => {
                            for b in &buf[..n] {
                                if *b == b'\n' {
                                    emit_line(levels[i], &lines[i]);
                                    lines[i].clear();
                                } else {
                                    lines[i].push(*b);
                                }
                            }
                        }
                    }
                }
            }

            let status = match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => code,
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    log::trace!("'{cmdline}' killed by signal {signal:?}");
                    -1
                }
                _ => -1,
            };
            log::trace!("'{cmdline}' returned {status}");
            Ok(status)
        }
    }
}

fn emit_line(level: NotifyLevel, line: &[u8]) {
    if line.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(line);
    match level {
        NotifyLevel::Error => log::error!("{text}"),
        NotifyLevel::Warn => log::warn!("{text}"),
        NotifyLevel::Info => log::info!("{text}"),
        NotifyLevel::Debug => log::debug!("{text}"),
        NotifyLevel::Trace => log::trace!("{text}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_command_returns_exit_status() {
        assert_eq!(run_command("exit 0").unwrap(), 0);
        assert_eq!(run_command("exit 3").unwrap(), 3);
        assert_eq!(run_command("").unwrap(), 0);
        assert_eq!(run_command("   ").unwrap(), 0);
    }

    #[test]
    fn run_command_consumes_output() {
        // several lines on several descriptors must not deadlock
        let status = run_command(
            "for i in $(seq 1 50); do echo out $i; echo err $i >&2; done; \
             echo extra >&3; echo warn >&4; exit 7",
        )
        .unwrap();
        assert_eq!(status, 7);
    }

    #[test]
    fn ready_barrier_blocks_until_all_ready() {
        use std::sync::Arc;
        let barrier = Arc::new(ReadyBarrier::new());
        barrier.register();
        barrier.register();
        let b = barrier.clone();
        let t = std::thread::spawn(move || {
            b.ready();
            b.ready();
        });
        barrier.wait_all_ready();
        t.join().unwrap();
    }
}
