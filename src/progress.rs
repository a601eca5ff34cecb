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

//! Progress bookkeeping and fan-out to progress-socket subscribers.
//!
//! Subscribers are assumed to consume events promptly; to keep a slow
//! listener from stalling the installer, sends never block.  A send that
//! would block is retried a few times, one second apart, and then the
//! listener is dropped.

use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use crate::ipc::{
    encode_progress_msg, send_record_nonblock, ProgressMessage, RecoveryStatus, SourceType,
    IPC_API_VERSION,
};

const SEND_ATTEMPTS: u32 = 5;

#[derive(Default)]
struct ProgressInner {
    msg: ProgressMessage,
    step_running: bool,
    conns: Vec<UnixStream>,
}

#[derive(Default)]
pub struct Progress {
    inner: Mutex<ProgressInner>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receive-only subscriber.
    pub fn add_connection(&self, stream: UnixStream) {
        self.inner.lock().unwrap().conns.push(stream);
    }

    fn send(inner: &mut ProgressInner) {
        inner.msg.api_version = IPC_API_VERSION;
        let record = match encode_progress_msg(&inner.msg) {
            Ok(record) => record,
            Err(_) => return,
        };
        inner
            .conns
            .retain(|conn| send_record_nonblock(conn.as_raw_fd(), &record, SEND_ATTEMPTS));
    }

    /// Start a new installation with a known step count.
    pub fn start(&self, nsteps: u32, source: SourceType, info: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.msg = ProgressMessage {
            status: RecoveryStatus::Start,
            nsteps,
            source,
            info: info.to_string(),
            ..Default::default()
        };
        Self::send(&mut inner);
        // info is an event, not state
        inner.msg.info.clear();
    }

    /// Account one more step, discovered after `start`.
    pub fn add_step(&self) {
        self.inner.lock().unwrap().msg.nsteps += 1;
    }

    /// Enter the next step.
    pub fn step_started(&self, image: &str, handler: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.msg.cur_step += 1;
        inner.msg.cur_percent = 0;
        inner.msg.cur_image = image.to_string();
        inner.msg.hnd_name = handler.to_string();
        inner.msg.status = RecoveryStatus::Run;
        inner.step_running = true;
        Self::send(&mut inner);
    }

    /// Whole-percent advance inside the current step.
    pub fn update(&self, percent: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.step_running && percent != inner.msg.cur_percent {
            inner.msg.status = RecoveryStatus::Progress;
            inner.msg.cur_percent = percent;
            Self::send(&mut inner);
        }
    }

    pub fn step_completed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.step_running = false;
        inner.msg.status = RecoveryStatus::Idle;
    }

    /// Download progress from the byte source.
    pub fn download_update(&self, percent: u32, bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        if percent != inner.msg.dwl_percent {
            inner.msg.status = RecoveryStatus::Download;
            inner.msg.dwl_percent = percent;
            inner.msg.dwl_bytes = bytes;
            Self::send(&mut inner);
        }
    }

    /// Out-of-band information event (e.g. reboot mode).
    pub fn info(&self, status: RecoveryStatus, info: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.msg.info = info.to_string();
        inner.msg.status = status;
        Self::send(&mut inner);
        inner.msg.info.clear();
    }

    /// Terminal event of an installation.
    pub fn end(&self, status: RecoveryStatus) {
        let mut inner = self.inner.lock().unwrap();
        inner.step_running = false;
        inner.msg.status = status;
        Self::send(&mut inner);
        inner.msg.nsteps = 0;
        inner.msg.cur_step = 0;
        inner.msg.cur_percent = 0;
        inner.msg.dwl_percent = 0;
        inner.msg.dwl_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::read_progress_msg;

    #[test]
    fn events_reach_subscriber_in_order() {
        let progress = Progress::new();
        let (client, server) = UnixStream::pair().unwrap();
        progress.add_connection(server);

        progress.start(2, SourceType::Cli, "request info");
        progress.step_started("rootfs.img", "raw");
        progress.update(50);
        progress.update(50); // duplicate, not sent
        progress.update(100);
        progress.step_completed();
        progress.end(RecoveryStatus::Success);

        let mut client = client;
        let start = read_progress_msg(&mut client).unwrap();
        assert_eq!(start.status, RecoveryStatus::Start);
        assert_eq!(start.nsteps, 2);
        assert_eq!(start.info, "request info");

        let step = read_progress_msg(&mut client).unwrap();
        assert_eq!(step.status, RecoveryStatus::Run);
        assert_eq!(step.cur_step, 1);
        assert_eq!(step.cur_image, "rootfs.img");
        assert_eq!(step.hnd_name, "raw");
        // info was reset after the start event
        assert_eq!(step.info, "");

        let p50 = read_progress_msg(&mut client).unwrap();
        assert_eq!((p50.status, p50.cur_percent), (RecoveryStatus::Progress, 50));
        let p100 = read_progress_msg(&mut client).unwrap();
        assert_eq!(p100.cur_percent, 100);

        let end = read_progress_msg(&mut client).unwrap();
        assert_eq!(end.status, RecoveryStatus::Success);
    }

    #[test]
    fn updates_outside_a_step_are_dropped() {
        let progress = Progress::new();
        let (client, server) = UnixStream::pair().unwrap();
        progress.add_connection(server);
        progress.update(10);
        drop(progress);
        // no record was produced
        let mut client = client;
        read_progress_msg(&mut client).unwrap_err();
    }

    #[test]
    fn dead_subscriber_dropped() {
        let progress = Progress::new();
        let (client, server) = UnixStream::pair().unwrap();
        progress.add_connection(server);
        drop(client);
        progress.start(1, SourceType::Cli, "");
        progress.start(1, SourceType::Cli, "");
        assert!(progress.inner.lock().unwrap().conns.is_empty());
    }
}
