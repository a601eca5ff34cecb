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

//! The controller: accepts requests on the control socket, owns the
//! single-installation state, wakes the installer thread, and relays
//! subprocess RPCs.
//!
//! Threads: an accept loop per socket, one installer thread parked on a
//! condition variable, and one worker serializing subprocess RPCs so a
//! slow child cannot stall the accept loop.

use anyhow::{Context, Result};
use nix::poll::{poll, PollFd, PollFlags};
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::agent::UpdateAgent;
use crate::installer;
use crate::ipc::{
    read_ctrl_msg, write_ctrl_msg, InstallRequest, MsgPayload, MsgType, NotifyLevel,
    RecoveryStatus, StatusReply, SubprocessMsg, IPC_API_VERSION,
};
use crate::state::UpdateState;
use crate::supervisor::{run_command, ReadyBarrier};

const DEFAULT_RPC_TIMEOUT_SECS: u32 = 60;

#[derive(Default)]
struct InstallerState {
    status: RecoveryStatus,
    last_install: RecoveryStatus,
    last_error: u32,
    request: InstallRequest,
    stream: Option<UnixStream>,
}

#[derive(Default)]
struct InstallerCell {
    state: Mutex<InstallerState>,
    cond: Condvar,
}

#[derive(Default)]
struct RpcQueue {
    queue: Mutex<VecDeque<(UnixStream, SubprocessMsg)>>,
    cond: Condvar,
}

pub struct Controller {
    pub threads: Vec<JoinHandle<()>>,
}

/// Bind both sockets and start the controller threads.
pub fn start(agent: Arc<UpdateAgent>, barrier: Arc<ReadyBarrier>) -> Result<Controller> {
    let ctrl_path = agent.config.ctrl_socket.clone();
    let progress_path = agent.config.progress_socket.clone();
    let _ = std::fs::remove_file(&ctrl_path);
    let _ = std::fs::remove_file(&progress_path);
    let ctrl = UnixListener::bind(&ctrl_path)
        .with_context(|| format!("binding control socket {}", ctrl_path.display()))?;
    let progress = UnixListener::bind(&progress_path)
        .with_context(|| format!("binding progress socket {}", progress_path.display()))?;

    let cell = Arc::new(InstallerCell::default());
    let rpcs = Arc::new(RpcQueue::default());
    let mut threads = Vec::new();

    for _ in 0..4 {
        barrier.register();
    }

    {
        let agent = agent.clone();
        let barrier = barrier.clone();
        threads.push(std::thread::spawn(move || {
            barrier.ready();
            for conn in progress.incoming() {
                match conn {
                    Ok(stream) => agent.progress.add_connection(stream),
                    Err(e) => log::trace!("progress accept: {e}"),
                }
            }
        }));
    }

    {
        let agent = agent.clone();
        let cell = cell.clone();
        let rpcs = rpcs.clone();
        let barrier = barrier.clone();
        threads.push(std::thread::spawn(move || {
            barrier.ready();
            for conn in ctrl.incoming() {
                match conn {
                    Ok(stream) => handle_connection(&agent, &cell, &rpcs, stream),
                    Err(e) => log::trace!("control accept: {e}"),
                }
            }
        }));
    }

    {
        let agent = agent.clone();
        let cell = cell.clone();
        let barrier = barrier.clone();
        threads.push(std::thread::spawn(move || {
            barrier.ready();
            installer_loop(&agent, &cell);
        }));
    }

    {
        let agent = agent.clone();
        let rpcs = rpcs.clone();
        threads.push(std::thread::spawn(move || {
            barrier.ready();
            rpc_loop(&agent, &rpcs);
        }));
    }

    Ok(Controller { threads })
}

fn reply(stream: &mut UnixStream, msgtype: MsgType, payload: &MsgPayload) {
    if let Err(e) = write_ctrl_msg(stream, msgtype, payload) {
        log::trace!("error writing on control socket: {e:#}");
    }
}

fn handle_connection(
    agent: &Arc<UpdateAgent>,
    cell: &Arc<InstallerCell>,
    rpcs: &Arc<RpcQueue>,
    mut stream: UnixStream,
) {
    let (msgtype, payload) = match read_ctrl_msg(&mut stream) {
        Ok(msg) => msg,
        Err(e) => {
            log::trace!("dropping control connection: {e:#}");
            return;
        }
    };

    match (msgtype, payload) {
        (MsgType::ReqInstall, MsgPayload::Install(request)) => {
            let mut state = cell.state.lock().unwrap();
            if state.status != RecoveryStatus::Idle {
                reply(
                    &mut stream,
                    MsgType::Nack,
                    &MsgPayload::Text("Installation in progress".into()),
                );
                return;
            }
            if request.api_version != IPC_API_VERSION {
                reply(
                    &mut stream,
                    MsgType::Nack,
                    &MsgPayload::Text("unsupported API version".into()),
                );
                return;
            }
            if !agent.selection_allowed(&request.software_set, &request.running_mode) {
                reply(
                    &mut stream,
                    MsgType::Nack,
                    &MsgPayload::Text("selection not allowed".into()),
                );
                return;
            }
            reply(&mut stream, MsgType::Ack, &MsgPayload::Empty);
            // drop stale notifications from the previous run
            agent.notifier.clear();
            state.status = RecoveryStatus::Run;
            state.request = request;
            state.stream = Some(stream);
            cell.cond.notify_one();
        }
        (MsgType::GetStatus, _) => {
            let state = cell.state.lock().unwrap();
            let mut status = StatusReply {
                current: state.status,
                last_result: state.last_install,
                error: state.last_error,
                desc: String::new(),
            };
            drop(state);
            if let Some(n) = agent.notifier.pop_pending() {
                status.current = n.status;
                status.error = n.error;
                status.desc = n.msg;
            }
            reply(&mut stream, MsgType::Ack, &MsgPayload::Status(status));
        }
        (MsgType::NotifyStream, _) => {
            let state = cell.state.lock().unwrap();
            let status = StatusReply {
                current: state.status,
                last_result: state.last_install,
                error: state.last_error,
                desc: String::new(),
            };
            drop(state);
            reply(&mut stream, MsgType::Ack, &MsgPayload::Status(status));
            if !agent.notifier.subscribe(stream) {
                log::trace!("notify subscriber went away during replay");
            }
        }
        (MsgType::PostUpdate, _) => {
            let ok = if agent.config.postupdate_cmd.is_empty() {
                false
            } else {
                matches!(run_command(&agent.config.postupdate_cmd), Ok(0))
            };
            if ok {
                reply(
                    &mut stream,
                    MsgType::Ack,
                    &MsgPayload::Text("Post-update actions successfully executed".into()),
                );
            } else {
                reply(
                    &mut stream,
                    MsgType::Nack,
                    &MsgPayload::Text("Post-update actions failed".into()),
                );
            }
        }
        (MsgType::SubprocessRpc, MsgPayload::Subprocess(msg)) => {
            // the worker owns the socket from here and sends the reply
            let mut queue = rpcs.queue.lock().unwrap();
            queue.push_back((stream, msg));
            rpcs.cond.notify_one();
        }
        (MsgType::SetAesKey, MsgPayload::AesKey { key_hex, iv_hex }) => {
            match agent.set_aes_key(&key_hex, &iv_hex) {
                Ok(()) => reply(&mut stream, MsgType::Ack, &MsgPayload::Empty),
                Err(e) => reply(
                    &mut stream,
                    MsgType::Nack,
                    &MsgPayload::Text(format!("{e:#}")),
                ),
            }
        }
        (
            MsgType::SetVersionsRange,
            MsgPayload::VersionsRange {
                minimum,
                maximum,
                current,
            },
        ) => {
            agent.set_version_range(&minimum, &maximum, &current);
            reply(&mut stream, MsgType::Ack, &MsgPayload::Empty);
        }
        (MsgType::GetHwRevision, _) => {
            reply(
                &mut stream,
                MsgType::Ack,
                &MsgPayload::HwRevision {
                    boardname: agent.hw.boardname.clone(),
                    revision: agent.hw.revision.clone(),
                },
            );
        }
        (MsgType::SetUpdateState, MsgPayload::UpdateState(value)) => {
            let result = UpdateState::from_str_value(&value)
                .ok_or(())
                .and_then(|s| agent.markers.save_state(s).map_err(|_| ()));
            match result {
                Ok(()) => reply(&mut stream, MsgType::Ack, &MsgPayload::Empty),
                Err(()) => reply(
                    &mut stream,
                    MsgType::Nack,
                    &MsgPayload::Text("invalid state change".into()),
                ),
            }
        }
        (MsgType::GetUpdateState, _) => {
            reply(
                &mut stream,
                MsgType::Ack,
                &MsgPayload::UpdateState(agent.markers.get_state().as_str().to_string()),
            );
        }
        (
            MsgType::SetAgentVar,
            MsgPayload::Var {
                namespace,
                name,
                value,
            },
        ) => {
            let value = if value.is_empty() { None } else { Some(value.as_str()) };
            match agent.set_var(&namespace, &name, value) {
                Ok(()) => reply(&mut stream, MsgType::Ack, &MsgPayload::Empty),
                Err(_) => reply(&mut stream, MsgType::Nack, &MsgPayload::Empty),
            }
        }
        (MsgType::GetAgentVar, MsgPayload::Var { namespace, name, .. }) => {
            match agent.get_var(&namespace, &name) {
                Ok(Some(value)) => reply(
                    &mut stream,
                    MsgType::Ack,
                    &MsgPayload::Var {
                        namespace,
                        name,
                        value,
                    },
                ),
                _ => reply(&mut stream, MsgType::Nack, &MsgPayload::Empty),
            }
        }
        (msgtype, _) => {
            log::trace!("rejecting request {msgtype:?} with unusable payload");
            reply(&mut stream, MsgType::Nack, &MsgPayload::Empty);
        }
    }
}

/// The installer thread: park until the accept loop hands over a request
/// and its socket, then consume the socket as the bundle stream.
fn installer_loop(agent: &Arc<UpdateAgent>, cell: &Arc<InstallerCell>) {
    loop {
        let (mut stream, request) = {
            let mut state = cell.state.lock().unwrap();
            loop {
                if let Some(stream) = state.stream.take() {
                    break (stream, state.request.clone());
                }
                state = cell.cond.wait(state).unwrap();
            }
        };

        let result = installer::run_update(agent, &mut stream, &request);

        let mut state = cell.state.lock().unwrap();
        match result {
            Ok(()) => {
                state.last_install = RecoveryStatus::Success;
                state.last_error = 0;
            }
            Err(e) => {
                log::error!("installation failed: {e:#}");
                state.last_install = RecoveryStatus::Failure;
                state.last_error = 1;
            }
        }
        state.status = RecoveryStatus::Idle;
        drop(state);
        agent.notifier.notify(
            RecoveryStatus::Idle,
            0,
            NotifyLevel::Info,
            "Waiting for requests...",
        );
    }
}

/// Serialize subprocess RPCs: forward the record to the child's pipe and
/// relay the reply, NACKing on timeout.
fn rpc_loop(agent: &Arc<UpdateAgent>, rpcs: &Arc<RpcQueue>) {
    loop {
        let (mut stream, msg) = {
            let mut queue = rpcs.queue.lock().unwrap();
            loop {
                if let Some(item) = queue.pop_front() {
                    break item;
                }
                queue = rpcs.cond.wait(queue).unwrap();
            }
        };

        match forward_rpc(agent, &msg) {
            Ok(payload) => reply(&mut stream, MsgType::Ack, &payload),
            Err(e) => {
                log::trace!("subprocess rpc failed: {e:#}");
                reply(&mut stream, MsgType::Nack, &MsgPayload::Empty);
            }
        }
    }
}

fn forward_rpc(agent: &Arc<UpdateAgent>, msg: &SubprocessMsg) -> Result<MsgPayload> {
    let pipe = agent
        .supervisor
        .pipe_for(msg.source)
        .context("no channel for the requested process")?;
    log::trace!(
        "forwarding message to {}",
        agent.supervisor.name_for(msg.source)
    );

    drain_pipe(pipe);

    let mut record = Vec::with_capacity(crate::ipc::CTRL_MSG_SIZE);
    write_ctrl_msg(
        &mut record,
        MsgType::SubprocessRpc,
        &MsgPayload::Subprocess(msg.clone()),
    )?;
    let mut written = 0;
    while written < record.len() {
        match nix::unistd::write(pipe, &record[written..]) {
            Ok(n) => written += n,
            Err(e) => anyhow::bail!("writing to subprocess pipe: {e}"),
        }
    }

    let timeout = if msg.timeout == 0 {
        DEFAULT_RPC_TIMEOUT_SECS
    } else {
        msg.timeout
    };
    let mut pollfd = [PollFd::new(pipe, PollFlags::POLLIN)];
    match poll(&mut pollfd, (timeout as i32) * 1000) {
        Ok(n) if n > 0 => {}
        _ => anyhow::bail!("subprocess did not answer within {timeout}s"),
    }

    let mut reply_record = vec![0u8; crate::ipc::CTRL_MSG_SIZE];
    let mut filled = 0;
    while filled < reply_record.len() {
        match nix::unistd::read(pipe, &mut reply_record[filled..]) {
            Ok(0) => anyhow::bail!("subprocess pipe closed"),
            Ok(n) => filled += n,
            Err(e) => anyhow::bail!("reading subprocess reply: {e}"),
        }
    }
    let (_, payload) = read_ctrl_msg(&mut &reply_record[..])?;
    Ok(payload)
}

/// Drop stale messages a child may have left in its pipe.
fn drain_pipe(fd: RawFd) {
    let mut buf = [0u8; 4096];
    loop {
        let mut pollfd = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut pollfd, 10) {
            Ok(n) if n > 0 => match nix::unistd::read(fd, &mut buf) {
                Ok(n) if n > 0 => continue,
                _ => break,
            },
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testutil::test_agent;
    use crate::cpio::testutil::archive;
    use crate::handler::{register_handler, HandlerData, IMAGE_HANDLER};
    use crate::manifest::MANIFEST_NAME;
    use std::io::Write;
    use std::sync::Once;
    use std::time::Duration;

    static REGISTER: Once = Once::new();

    fn register_test_handlers() {
        REGISTER.call_once(|| {
            register_handler("ctrl-testfile", IMAGE_HANDLER, |image, data| {
                let stream = match data {
                    HandlerData::Stream(stream) => stream,
                    _ => panic!("test handler wants a stream"),
                };
                let mut out = std::fs::File::create(&image.device)?;
                std::io::copy(stream, &mut out)?;
                Ok(())
            });
        });
    }

    fn start_controller() -> (Arc<UpdateAgent>, tempfile::TempDir) {
        let (agent, dir) = test_agent();
        let barrier = Arc::new(ReadyBarrier::new());
        start(agent.clone(), barrier.clone()).unwrap();
        barrier.wait_all_ready();
        (agent, dir)
    }

    fn test_bundle(dest: &std::path::Path) -> Vec<u8> {
        let text = format!(
            r#"software = {{
                version = "1.0";
                images: ( {{
                    filename = "app.img";
                    type = "ctrl-testfile";
                    device = "{}";
                }} );
            }};"#,
            dest.display()
        );
        archive(
            &[(MANIFEST_NAME, text.as_bytes()), ("app.img", b"payload")],
            true,
        )
    }

    fn connect(agent: &UpdateAgent) -> UnixStream {
        UnixStream::connect(&agent.config.ctrl_socket).unwrap()
    }

    fn get_status(agent: &UpdateAgent) -> StatusReply {
        let mut conn = connect(agent);
        write_ctrl_msg(&mut conn, MsgType::GetStatus, &MsgPayload::Empty).unwrap();
        match read_ctrl_msg(&mut conn).unwrap() {
            (MsgType::Ack, MsgPayload::Status(status)) => status,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn wait_for_idle_success(agent: &UpdateAgent) {
        for _ in 0..100 {
            let status = get_status(agent);
            if status.current == RecoveryStatus::Idle
                && status.last_result == RecoveryStatus::Success
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("installation did not finish");
    }

    #[test]
    fn concurrent_install_requests_one_winner() {
        register_test_handlers();
        let (agent, dir) = start_controller();
        let dest = dir.path().join("dest.img");
        let bundle = test_bundle(&dest);

        // first requester is granted and holds the installer...
        let mut first = connect(&agent);
        write_ctrl_msg(
            &mut first,
            MsgType::ReqInstall,
            &MsgPayload::Install(InstallRequest::new()),
        )
        .unwrap();
        let (reply_type, _) = read_ctrl_msg(&mut first).unwrap();
        assert_eq!(reply_type, MsgType::Ack);

        // ...so the second is refused while the stream is still open
        std::thread::sleep(Duration::from_millis(10));
        let mut second = connect(&agent);
        write_ctrl_msg(
            &mut second,
            MsgType::ReqInstall,
            &MsgPayload::Install(InstallRequest::new()),
        )
        .unwrap();
        match read_ctrl_msg(&mut second).unwrap() {
            (MsgType::Nack, MsgPayload::Text(text)) => {
                assert!(text.contains("Installation in progress"));
            }
            other => panic!("expected busy NACK, got {other:?}"),
        }

        // the winner now streams the bundle and succeeds
        first.write_all(&bundle).unwrap();
        drop(first);
        wait_for_idle_success(&agent);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }

    #[test]
    fn notify_stream_replays_backlog() {
        register_test_handlers();
        let (agent, dir) = start_controller();
        let dest = dir.path().join("dest.img");
        let bundle = test_bundle(&dest);

        let mut requester = connect(&agent);
        write_ctrl_msg(
            &mut requester,
            MsgType::ReqInstall,
            &MsgPayload::Install(InstallRequest::new()),
        )
        .unwrap();
        read_ctrl_msg(&mut requester).unwrap();
        requester.write_all(&bundle).unwrap();
        drop(requester);

        // late subscriber: status snapshot first, then the backlog in
        // production order, then live notifications.  get-status would
        // drain the queue, so completion is awaited by re-subscribing
        // until the replay contains the terminal notification.
        let mut subscriber = None;
        let mut replayed = Vec::new();
        for _ in 0..100 {
            let mut conn = connect(&agent);
            write_ctrl_msg(&mut conn, MsgType::NotifyStream, &MsgPayload::Empty).unwrap();
            let (reply_type, payload) = read_ctrl_msg(&mut conn).unwrap();
            assert_eq!(reply_type, MsgType::Ack);
            assert!(matches!(payload, MsgPayload::Status(_)));

            conn.set_read_timeout(Some(Duration::from_millis(300)))
                .unwrap();
            let mut backlog = Vec::new();
            while let Ok((MsgType::NotifyStream, MsgPayload::Notification(n))) =
                read_ctrl_msg(&mut conn)
            {
                let done = n.msg.contains("updated successfully");
                backlog.push(n);
                if done {
                    break;
                }
            }
            if backlog.iter().any(|n| n.msg.contains("updated successfully")) {
                subscriber = Some(conn);
                replayed = backlog;
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let mut subscriber = subscriber.expect("installation never finished");
        assert!(replayed
            .iter()
            .any(|n| n.msg.contains("Software update started")));
        assert!(replayed
            .iter()
            .any(|n| n.msg.contains("Software updated successfully")));
        let success_idx = replayed
            .iter()
            .position(|n| n.msg.contains("updated successfully"))
            .unwrap();
        let start_idx = replayed
            .iter()
            .position(|n| n.msg.contains("update started"))
            .unwrap();
        assert!(start_idx < success_idx);

        // live push still works after the replay
        agent
            .notifier
            .notify(RecoveryStatus::Idle, 0, NotifyLevel::Info, "live event");
        subscriber
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        loop {
            match read_ctrl_msg(&mut subscriber) {
                Ok((_, MsgPayload::Notification(n))) if n.msg == "live event" => break,
                Ok(_) => continue,
                Err(e) => panic!("live notification missing: {e:#}"),
            }
        }
    }

    #[test]
    fn metadata_rpcs() {
        let (agent, _dir) = start_controller();

        // hardware revision
        let mut conn = connect(&agent);
        write_ctrl_msg(&mut conn, MsgType::GetHwRevision, &MsgPayload::Empty).unwrap();
        match read_ctrl_msg(&mut conn).unwrap() {
            (MsgType::Ack, MsgPayload::HwRevision { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }

        // state marker over IPC obeys the transition rules
        let mut conn = connect(&agent);
        write_ctrl_msg(
            &mut conn,
            MsgType::SetUpdateState,
            &MsgPayload::UpdateState(UpdateState::InProgress.as_str().into()),
        )
        .unwrap();
        assert_eq!(read_ctrl_msg(&mut conn).unwrap().0, MsgType::Ack);
        let mut conn = connect(&agent);
        write_ctrl_msg(
            &mut conn,
            MsgType::SetUpdateState,
            &MsgPayload::UpdateState(UpdateState::Testing.as_str().into()),
        )
        .unwrap();
        assert_eq!(read_ctrl_msg(&mut conn).unwrap().0, MsgType::Nack);

        // vars roundtrip
        let mut conn = connect(&agent);
        write_ctrl_msg(
            &mut conn,
            MsgType::SetAgentVar,
            &MsgPayload::Var {
                namespace: String::new(),
                name: "channel".into(),
                value: "stable".into(),
            },
        )
        .unwrap();
        assert_eq!(read_ctrl_msg(&mut conn).unwrap().0, MsgType::Ack);
        let mut conn = connect(&agent);
        write_ctrl_msg(
            &mut conn,
            MsgType::GetAgentVar,
            &MsgPayload::Var {
                namespace: String::new(),
                name: "channel".into(),
                value: String::new(),
            },
        )
        .unwrap();
        match read_ctrl_msg(&mut conn).unwrap() {
            (MsgType::Ack, MsgPayload::Var { value, .. }) => assert_eq!(value, "stable"),
            other => panic!("unexpected {other:?}"),
        }

        // AES key
        let mut conn = connect(&agent);
        write_ctrl_msg(
            &mut conn,
            MsgType::SetAesKey,
            &MsgPayload::AesKey {
                key_hex: "11".repeat(16),
                iv_hex: "22".repeat(16),
            },
        )
        .unwrap();
        assert_eq!(read_ctrl_msg(&mut conn).unwrap().0, MsgType::Ack);
        assert!(agent.aes_key().is_some());
    }

    #[test]
    fn subprocess_rpc_roundtrip() {
        use crate::ipc::{SourceType, CTRL_MSG_SIZE};
        use crate::supervisor::ChildEntry;

        // child echoing one record back on its RPC pipe
        fn echo_child(fd: RawFd) -> i32 {
            let mut buf = vec![0u8; CTRL_MSG_SIZE];
            let mut filled = 0;
            while filled < buf.len() {
                match nix::unistd::read(fd, &mut buf[filled..]) {
                    Ok(0) | Err(_) => return 1,
                    Ok(n) => filled += n,
                }
            }
            let mut written = 0;
            while written < buf.len() {
                match nix::unistd::write(fd, &buf[written..]) {
                    Ok(n) => written += n,
                    Err(_) => return 1,
                }
            }
            0
        }

        let (agent, _dir) = start_controller();
        agent
            .supervisor
            .spawn(
                "echo",
                SourceType::Subprocess,
                nix::unistd::getuid().as_raw(),
                nix::unistd::getgid().as_raw(),
                ChildEntry::Func(echo_child),
            )
            .unwrap();

        let mut conn = connect(&agent);
        write_ctrl_msg(
            &mut conn,
            MsgType::SubprocessRpc,
            &MsgPayload::Subprocess(SubprocessMsg {
                source: SourceType::Subprocess,
                cmd: 7,
                timeout: 10,
                data: "ping".into(),
            }),
        )
        .unwrap();
        match read_ctrl_msg(&mut conn).unwrap() {
            (MsgType::Ack, MsgPayload::Subprocess(reply)) => {
                assert_eq!(reply.data, "ping");
                assert_eq!(reply.cmd, 7);
            }
            other => panic!("unexpected RPC reply {other:?}"),
        }
    }

    #[test]
    fn rpc_for_unknown_subprocess_nacked() {
        let (agent, _dir) = start_controller();
        let mut conn = connect(&agent);
        write_ctrl_msg(
            &mut conn,
            MsgType::SubprocessRpc,
            &MsgPayload::Subprocess(SubprocessMsg {
                source: crate::ipc::SourceType::Subprocess,
                cmd: 1,
                timeout: 1,
                data: "ping".into(),
            }),
        )
        .unwrap();
        assert_eq!(read_ctrl_msg(&mut conn).unwrap().0, MsgType::Nack);
    }

    #[test]
    fn garbage_on_control_socket_only_drops_that_connection() {
        let (agent, _dir) = start_controller();
        let mut conn = connect(&agent);
        conn.write_all(&[0u8; 32]).unwrap();
        drop(conn);
        // the controller is still alive
        let status = get_status(&agent);
        assert_eq!(status.current, RecoveryStatus::Idle);
    }
}
