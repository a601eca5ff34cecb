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

//! Wire formats of the control and progress sockets.
//!
//! Every message is a fixed-size record: a 32-bit magic, a 32-bit message
//! type, a 32-bit payload length and the bincode-encoded payload, zero
//! padded to the record size.  Fixed-size records keep the protocol
//! trivially framed for C and shell clients that read whole records.

use anyhow::{anyhow, bail, Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::errors::UpdateError;

pub const IPC_MAGIC: u32 = 0x1405_2001;
pub const IPC_API_VERSION: u32 = 0x0001;

/// Fixed size of a control-socket record.
pub const CTRL_MSG_SIZE: usize = 4096;
/// Fixed size of a progress-socket record.
pub const PROGRESS_MSG_SIZE: usize = 2048;

const HEADER_SIZE: usize = 12;

/// Uniform bincode options for all socket serialization.
fn bincoder() -> impl bincode::Options {
    bincode::options()
        .allow_trailing_bytes()
        .with_no_limit()
        .with_little_endian()
        .with_varint_encoding()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    ReqInstall = 0,
    Ack = 1,
    Nack = 2,
    GetStatus = 3,
    PostUpdate = 4,
    SubprocessRpc = 5,
    NotifyStream = 6,
    SetAesKey = 7,
    SetVersionsRange = 8,
    GetHwRevision = 9,
    SetUpdateState = 10,
    GetUpdateState = 11,
    SetAgentVar = 12,
    GetAgentVar = 13,
}

impl TryFrom<u32> for MsgType {
    type Error = anyhow::Error;

    fn try_from(v: u32) -> Result<Self> {
        use MsgType::*;
        Ok(match v {
            0 => ReqInstall,
            1 => Ack,
            2 => Nack,
            3 => GetStatus,
            4 => PostUpdate,
            5 => SubprocessRpc,
            6 => NotifyStream,
            7 => SetAesKey,
            8 => SetVersionsRange,
            9 => GetHwRevision,
            10 => SetUpdateState,
            11 => GetUpdateState,
            12 => SetAgentVar,
            13 => GetAgentVar,
            other => {
                return Err(anyhow!(UpdateError::Ipc(format!(
                    "unknown message type {other}"
                ))))
            }
        })
    }
}

/// Who triggered an update; also addresses subprocess RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum SourceType {
    #[default]
    Unknown = 0,
    Cli = 1,
    Ipc = 2,
    Subprocess = 3,
}

/// Installation status as reported over IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum RecoveryStatus {
    #[default]
    Idle = 0,
    Start = 1,
    Run = 2,
    Success = 3,
    Failure = 4,
    Download = 5,
    Done = 6,
    Subprocess = 7,
    Progress = 8,
}

/// Notification severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NotifyLevel {
    Error = 0,
    Warn = 1,
    #[default]
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// Dry-run selection in an install request; `Default` keeps the agent's
/// configured behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RunMode {
    #[default]
    Default,
    DryRun,
    Install,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstallRequest {
    pub api_version: u32,
    pub source: SourceType,
    pub dry_run: RunMode,
    pub software_set: String,
    pub running_mode: String,
    /// Free-form requester information, replayed in progress events.
    pub info: String,
}

impl InstallRequest {
    pub fn new() -> Self {
        Self {
            api_version: IPC_API_VERSION,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubprocessMsg {
    /// Which child the message is for.
    pub source: SourceType,
    pub cmd: u32,
    /// Reply timeout in seconds; 0 selects the default.
    pub timeout: u32,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatusReply {
    pub current: RecoveryStatus,
    pub last_result: RecoveryStatus,
    pub error: u32,
    pub desc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationMsg {
    pub status: RecoveryStatus,
    pub error: u32,
    pub level: NotifyLevel,
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MsgPayload {
    Empty,
    /// Human-readable detail for ACK/NACK replies.
    Text(String),
    Install(InstallRequest),
    Status(StatusReply),
    Subprocess(SubprocessMsg),
    Notification(NotificationMsg),
    AesKey { key_hex: String, iv_hex: String },
    VersionsRange {
        minimum: String,
        maximum: String,
        current: String,
    },
    HwRevision { boardname: String, revision: String },
    UpdateState(String),
    Var {
        namespace: String,
        name: String,
        value: String,
    },
}

/// Serialize one fixed-size control record.
pub fn write_ctrl_msg(
    w: &mut impl Write,
    msgtype: MsgType,
    payload: &MsgPayload,
) -> Result<()> {
    let mut record = vec![0u8; CTRL_MSG_SIZE];
    encode_record(&mut record, msgtype as u32, payload)?;
    w.write_all(&record).context("writing control record")?;
    Ok(())
}

/// Read one fixed-size control record.
pub fn read_ctrl_msg(r: &mut impl Read) -> Result<(MsgType, MsgPayload)> {
    let mut record = vec![0u8; CTRL_MSG_SIZE];
    r.read_exact(&mut record)
        .map_err(|e| anyhow!(UpdateError::Ipc(format!("short control record: {e}"))))?;
    let (msgtype, payload) = decode_record(&record)?;
    Ok((MsgType::try_from(msgtype)?, payload))
}

/// Serialize one fixed-size progress record.
pub fn write_progress_msg(w: &mut impl Write, msg: &ProgressMessage) -> Result<()> {
    let record = encode_progress_msg(msg)?;
    w.write_all(&record).context("writing progress record")?;
    Ok(())
}

/// Encode a progress record without writing it, for non-blocking sends.
pub fn encode_progress_msg(msg: &ProgressMessage) -> Result<Vec<u8>> {
    let mut record = vec![0u8; PROGRESS_MSG_SIZE];
    encode_record(&mut record, RecoveryStatus::Progress as u32, msg)?;
    Ok(record)
}

/// Read one fixed-size progress record.
pub fn read_progress_msg(r: &mut impl Read) -> Result<ProgressMessage> {
    let mut record = vec![0u8; PROGRESS_MSG_SIZE];
    r.read_exact(&mut record)
        .map_err(|e| anyhow!(UpdateError::Ipc(format!("short progress record: {e}"))))?;
    let (_, msg) = decode_record(&record)?;
    Ok(msg)
}

fn encode_record<T: Serialize>(record: &mut [u8], msgtype: u32, payload: &T) -> Result<()> {
    let encoded = bincoder()
        .serialize(payload)
        .context("encoding IPC payload")?;
    if HEADER_SIZE + encoded.len() > record.len() {
        bail!(UpdateError::Ipc(format!(
            "payload of {} bytes exceeds record size",
            encoded.len()
        )));
    }
    record[0..4].copy_from_slice(&IPC_MAGIC.to_le_bytes());
    record[4..8].copy_from_slice(&msgtype.to_le_bytes());
    record[8..12].copy_from_slice(&(encoded.len() as u32).to_le_bytes());
    record[HEADER_SIZE..HEADER_SIZE + encoded.len()].copy_from_slice(&encoded);
    Ok(())
}

fn decode_record<T: for<'de> Deserialize<'de>>(record: &[u8]) -> Result<(u32, T)> {
    let magic = u32::from_le_bytes(record[0..4].try_into().unwrap());
    if magic != IPC_MAGIC {
        return Err(anyhow!(UpdateError::Ipc(format!(
            "bad magic {magic:#010x}"
        ))));
    }
    let msgtype = u32::from_le_bytes(record[4..8].try_into().unwrap());
    let len = u32::from_le_bytes(record[8..12].try_into().unwrap()) as usize;
    if HEADER_SIZE + len > record.len() {
        return Err(anyhow!(UpdateError::Ipc(format!(
            "payload length {len} exceeds record size"
        ))));
    }
    let payload = bincoder()
        .deserialize(&record[HEADER_SIZE..HEADER_SIZE + len])
        .map_err(|e| anyhow!(UpdateError::Ipc(format!("undecodable payload: {e}"))))?;
    Ok((msgtype, payload))
}

/// Send a whole record on a socket with SIGPIPE suppressed.  Returns
/// false if the peer is gone or not accepting data; the caller drops the
/// subscriber then.
pub fn send_record(fd: std::os::unix::io::RawFd, record: &[u8]) -> bool {
    use nix::sys::socket::{send, MsgFlags};
    let mut sent = 0;
    while sent < record.len() {
        match send(fd, &record[sent..], MsgFlags::MSG_NOSIGNAL) {
            Ok(0) | Err(_) => return false,
            Ok(n) => sent += n,
        }
    }
    true
}

/// Like [`send_record`] but never blocks: a send that would block is
/// retried up to `max_attempts` times, one second apart, before the peer
/// is declared dead.
pub fn send_record_nonblock(
    fd: std::os::unix::io::RawFd,
    record: &[u8],
    max_attempts: u32,
) -> bool {
    use nix::errno::Errno;
    use nix::sys::socket::{send, MsgFlags};
    let mut sent = 0;
    while sent < record.len() {
        let mut attempt = 0;
        loop {
            match send(
                fd,
                &record[sent..],
                MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT,
            ) {
                Ok(0) => return false,
                Ok(n) => {
                    sent += n;
                    break;
                }
                Err(Errno::EAGAIN) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return false;
                    }
                    std::thread::sleep(std::time::Duration::from_secs(1));
                }
                Err(_) => return false,
            }
        }
    }
    true
}

/// One progress-socket record.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProgressMessage {
    pub api_version: u32,
    pub status: RecoveryStatus,
    /// Total number of installation steps.
    pub nsteps: u32,
    pub cur_step: u32,
    pub cur_percent: u32,
    pub dwl_percent: u32,
    pub dwl_bytes: u64,
    pub cur_image: String,
    pub hnd_name: String,
    pub source: SourceType,
    pub info: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_record_roundtrip() {
        let mut buf = Vec::new();
        let req = InstallRequest {
            api_version: IPC_API_VERSION,
            source: SourceType::Cli,
            dry_run: RunMode::DryRun,
            software_set: "stable".into(),
            running_mode: "main".into(),
            info: "test".into(),
        };
        write_ctrl_msg(&mut buf, MsgType::ReqInstall, &MsgPayload::Install(req)).unwrap();
        assert_eq!(buf.len(), CTRL_MSG_SIZE);

        let (msgtype, payload) = read_ctrl_msg(&mut &buf[..]).unwrap();
        assert_eq!(msgtype, MsgType::ReqInstall);
        match payload {
            MsgPayload::Install(r) => {
                assert_eq!(r.software_set, "stable");
                assert_eq!(r.dry_run, RunMode::DryRun);
            }
            other => panic!("wrong payload {other:?}"),
        }
    }

    #[test]
    fn progress_record_roundtrip() {
        let msg = ProgressMessage {
            api_version: IPC_API_VERSION,
            status: RecoveryStatus::Run,
            nsteps: 3,
            cur_step: 1,
            cur_percent: 42,
            cur_image: "rootfs.img".into(),
            hnd_name: "raw".into(),
            ..Default::default()
        };
        let mut buf = Vec::new();
        write_progress_msg(&mut buf, &msg).unwrap();
        assert_eq!(buf.len(), PROGRESS_MSG_SIZE);
        assert_eq!(read_progress_msg(&mut &buf[..]).unwrap(), msg);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = Vec::new();
        write_ctrl_msg(&mut buf, MsgType::GetStatus, &MsgPayload::Empty).unwrap();
        buf[0] = 0;
        let err = read_ctrl_msg(&mut &buf[..]).unwrap_err();
        assert!(UpdateError::is_kind(&err, |e| {
            matches!(e, UpdateError::Ipc(_))
        }));
    }

    #[test]
    fn truncated_record_rejected() {
        let mut buf = Vec::new();
        write_ctrl_msg(&mut buf, MsgType::GetStatus, &MsgPayload::Empty).unwrap();
        buf.truncate(100);
        let err = read_ctrl_msg(&mut &buf[..]).unwrap_err();
        assert!(err.to_string().contains("short control record"));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = Vec::new();
        write_ctrl_msg(&mut buf, MsgType::GetStatus, &MsgPayload::Empty).unwrap();
        buf[4..8].copy_from_slice(&999u32.to_le_bytes());
        read_ctrl_msg(&mut &buf[..]).unwrap_err();
    }
}
