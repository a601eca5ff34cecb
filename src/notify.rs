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

//! Severity-tagged installer notifications.
//!
//! Notifications are kept in a bounded FIFO so late subscribers can catch
//! up, and are pushed live to every notify-stream subscriber.  A send
//! failure drops the subscriber.

use std::collections::VecDeque;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use crate::ipc::{
    send_record, write_ctrl_msg, MsgPayload, MsgType, NotificationMsg, NotifyLevel,
    RecoveryStatus,
};

/// How many notifications are replayed to late subscribers.
pub const MAX_CACHED_NOTIFICATIONS: usize = 100;

#[derive(Debug, Clone)]
pub struct Notification {
    pub status: RecoveryStatus,
    pub error: u32,
    pub level: NotifyLevel,
    pub msg: String,
}

impl Notification {
    fn to_wire(&self) -> NotificationMsg {
        NotificationMsg {
            status: self.status,
            error: self.error,
            level: self.level,
            msg: self.msg.clone(),
        }
    }
}

#[derive(Default)]
struct NotifierInner {
    queue: VecDeque<Notification>,
    subscribers: Vec<UnixStream>,
}

#[derive(Default)]
pub struct Notifier {
    inner: Mutex<NotifierInner>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and fan out one notification.
    pub fn notify(&self, status: RecoveryStatus, error: u32, level: NotifyLevel, msg: &str) {
        // newlines and tabs would break line-oriented consumers
        let msg: String = msg
            .chars()
            .map(|c| if matches!(c, '\n' | '\r' | '\t') { ' ' } else { c })
            .collect();
        match level {
            NotifyLevel::Error => log::error!("{msg}"),
            NotifyLevel::Warn => log::warn!("{msg}"),
            NotifyLevel::Info => log::info!("{msg}"),
            NotifyLevel::Debug => log::debug!("{msg}"),
            NotifyLevel::Trace => log::trace!("{msg}"),
        }
        let notification = Notification {
            status,
            error,
            level,
            msg,
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() >= MAX_CACHED_NOTIFICATIONS {
            inner.queue.pop_front();
        }
        inner.queue.push_back(notification.clone());

        let mut record = Vec::with_capacity(crate::ipc::CTRL_MSG_SIZE);
        if write_ctrl_msg(
            &mut record,
            MsgType::NotifyStream,
            &MsgPayload::Notification(notification.to_wire()),
        )
        .is_err()
        {
            return;
        }
        inner
            .subscribers
            .retain(|stream| send_record(stream.as_raw_fd(), &record));
    }

    /// Drain one pending notification; used by get-status polling.
    pub fn pop_pending(&self) -> Option<Notification> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    /// Drop the backlog of a previous installation.
    pub fn clear(&self) {
        self.inner.lock().unwrap().queue.clear();
    }

    /// Attach a subscriber: replay the cached backlog, then keep the
    /// socket for live pushes.  Returns false if the replay already
    /// failed and the socket was discarded.
    pub fn subscribe(&self, stream: UnixStream) -> bool {
        let mut inner = self.inner.lock().unwrap();
        for notification in &inner.queue {
            let mut record = Vec::with_capacity(crate::ipc::CTRL_MSG_SIZE);
            if write_ctrl_msg(
                &mut record,
                MsgType::NotifyStream,
                &MsgPayload::Notification(notification.to_wire()),
            )
            .is_err()
                || !send_record(stream.as_raw_fd(), &record)
            {
                return false;
            }
        }
        inner.subscribers.push(stream);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::read_ctrl_msg;

    #[test]
    fn queue_is_bounded() {
        let notifier = Notifier::new();
        for i in 0..(MAX_CACHED_NOTIFICATIONS + 10) {
            notifier.notify(
                RecoveryStatus::Run,
                0,
                NotifyLevel::Info,
                &format!("message {i}"),
            );
        }
        let inner = notifier.inner.lock().unwrap();
        assert_eq!(inner.queue.len(), MAX_CACHED_NOTIFICATIONS);
        assert_eq!(inner.queue.front().unwrap().msg, "message 10");
    }

    #[test]
    fn pop_drains_in_order() {
        let notifier = Notifier::new();
        notifier.notify(RecoveryStatus::Start, 0, NotifyLevel::Info, "first");
        notifier.notify(RecoveryStatus::Run, 0, NotifyLevel::Info, "second");
        assert_eq!(notifier.pop_pending().unwrap().msg, "first");
        assert_eq!(notifier.pop_pending().unwrap().msg, "second");
        assert!(notifier.pop_pending().is_none());
    }

    #[test]
    fn control_characters_flattened() {
        let notifier = Notifier::new();
        notifier.notify(RecoveryStatus::Run, 0, NotifyLevel::Info, "a\nb\tc");
        assert_eq!(notifier.pop_pending().unwrap().msg, "a b c");
    }

    #[test]
    fn subscriber_gets_backlog_and_live_messages() {
        let notifier = Notifier::new();
        notifier.notify(RecoveryStatus::Start, 0, NotifyLevel::Info, "early");

        let (client, server) = UnixStream::pair().unwrap();
        assert!(notifier.subscribe(server));
        notifier.notify(RecoveryStatus::Run, 0, NotifyLevel::Info, "live");

        let mut client = client;
        for expected in ["early", "live"] {
            let (msgtype, payload) = read_ctrl_msg(&mut client).unwrap();
            assert_eq!(msgtype, MsgType::NotifyStream);
            match payload {
                MsgPayload::Notification(n) => assert_eq!(n.msg, expected),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[test]
    fn dead_subscriber_dropped() {
        let notifier = Notifier::new();
        let (client, server) = UnixStream::pair().unwrap();
        assert!(notifier.subscribe(server));
        drop(client);
        // enough data to defeat socket buffering
        for _ in 0..4 {
            notifier.notify(RecoveryStatus::Run, 0, NotifyLevel::Info, "into the void");
        }
        assert!(notifier.inner.lock().unwrap().subscribers.is_empty());
    }
}
