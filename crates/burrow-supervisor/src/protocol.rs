//! Wire protocol between `wsh` and `wshd`.
//!
//! Frames are a 4-byte big-endian length followed by JSON. File
//! descriptors ride as SCM_RIGHTS ancillary data on a one-byte
//! payload, sent immediately after the `fds` response frame.

use crate::SupervisorError;
use burrow_schema::types::TtySpec;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

const MAX_FRAME: u32 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub user: String,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
    pub argv: Vec<String>,
    #[serde(default)]
    pub tty: Option<TtySpec>,
    #[serde(default)]
    pub rlimits: BTreeMap<String, u64>,
    #[serde(default = "default_drop_capabilities")]
    pub drop_capabilities: bool,
}

fn default_drop_capabilities() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Spawn(SpawnRequest),
    Signal { pid: i32, signal: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Fds { count: u8, pid: i32 },
    Exit { status: u8 },
    Error { message: String },
}

pub fn write_frame<T: Serialize>(
    writer: &mut impl Write,
    message: &T,
) -> Result<(), SupervisorError> {
    let body = serde_json::to_vec(message)?;
    let len = body.len() as u32;
    if len > MAX_FRAME {
        return Err(SupervisorError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> Result<T, SupervisorError> {
    let mut len = [0u8; 4];
    read_exact_or_closed(reader, &mut len)?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME {
        return Err(SupervisorError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len as usize];
    read_exact_or_closed(reader, &mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

fn read_exact_or_closed(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), SupervisorError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(SupervisorError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}

/// Send descriptors as SCM_RIGHTS on a one-byte payload.
pub fn send_fds(stream: &UnixStream, fds: &[RawFd]) -> Result<(), SupervisorError> {
    let iov = [IoSlice::new(b"F")];
    let control = [ControlMessage::ScmRights(fds)];
    sendmsg::<()>(
        stream.as_raw_fd(),
        &iov,
        &control,
        MsgFlags::empty(),
        None,
    )?;
    Ok(())
}

/// Receive exactly `expected` descriptors.
pub fn recv_fds(stream: &UnixStream, expected: usize) -> Result<Vec<OwnedFd>, SupervisorError> {
    let mut byte = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut byte)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 8]);

    let message = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )?;

    let mut fds = Vec::new();
    for cmsg in message.cmsgs() {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            for fd in raw {
                // SAFETY: the kernel just handed us ownership of fd.
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    if fds.len() != expected {
        return Err(SupervisorError::MissingDescriptors {
            expected,
            got: fds.len(),
        });
    }
    Ok(fds)
}
