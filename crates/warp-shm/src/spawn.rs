//! Worker processes
//!
//! [`spawn_worker`] starts a child process and hands it arguments encoded
//! with a [`ForkingCodec`]: tensors in the arguments reach the child as
//! store references, never as bytes. The child connects to the same store
//! (its endpoint is passed in `WARP_SHM_SOCKET`) and decodes them with
//! [`read_worker_args`].

use std::io::{Read, Write};
use std::process::{Child, Command, Output, Stdio};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::ENV_SOCKET;
use crate::error::{ShmError, ShmResult};
use crate::transport::ForkingCodec;

/// Largest argument payload a worker accepts
const MAX_ARGS_BYTES: u32 = 256 * 1024 * 1024;

/// A running worker process
pub struct Worker {
    program: String,
    child: Child,
}

impl Worker {
    /// Operating system process id
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Wait for the worker to exit.
    ///
    /// A non-zero exit becomes [`ShmError::Worker`] carrying the child's
    /// stderr, when captured.
    pub fn join(self) -> ShmResult<Output> {
        let program = self.program;
        let output = self
            .child
            .wait_with_output()
            .map_err(|e| ShmError::Worker(format!("waiting for {program}: {e}")))?;
        if output.status.success() {
            debug!(%program, "Worker finished");
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ShmError::Worker(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

/// Start `command` and send it `args` on stdin.
///
/// When the codec has a registered hook the child is pointed at the same
/// store endpoint. If the child cannot be started or fed its arguments, the
/// objects stored for them are deleted again.
pub fn spawn_worker<T>(codec: &ForkingCodec, mut command: Command, args: &T) -> ShmResult<Worker>
where
    T: Serialize + ?Sized,
{
    let (payload, stored) = codec.encode_tracked(args)?;
    let Some(length) = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len <= MAX_ARGS_BYTES)
    else {
        codec.release(&stored);
        return Err(ShmError::Worker(format!(
            "arguments of {} bytes are too large",
            payload.len()
        )));
    };

    if let Some(registration) = codec.registration() {
        command.env(ENV_SOCKET, &registration.hook().client().config().socket_path);
    }
    command.stdin(Stdio::piped());

    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            codec.release(&stored);
            return Err(ShmError::Worker(format!("failed to start {program}: {e}")));
        }
    };

    let written = match child.stdin.take() {
        Some(mut stdin) => stdin
            .write_all(&length.to_le_bytes())
            .and_then(|()| stdin.write_all(&payload))
            .and_then(|()| stdin.flush()),
        None => Err(std::io::Error::other("stdin not captured")),
    };
    if let Err(e) = written {
        let _ = child.kill();
        let _ = child.wait();
        codec.release(&stored);
        return Err(ShmError::Worker(format!(
            "failed to send arguments to {program}: {e}"
        )));
    }

    debug!(%program, pid = child.id(), bytes = payload.len(), "Spawned worker");
    Ok(Worker { program, child })
}

/// Read the arguments a parent sent with [`spawn_worker`]
pub fn read_worker_args<T, R>(codec: &ForkingCodec, mut reader: R) -> ShmResult<T>
where
    T: DeserializeOwned,
    R: Read,
{
    let mut head = [0u8; 4];
    reader
        .read_exact(&mut head)
        .map_err(|e| ShmError::Worker(format!("reading argument length: {e}")))?;
    let length = u32::from_le_bytes(head);
    if length > MAX_ARGS_BYTES {
        return Err(ShmError::Worker(format!(
            "argument payload of {length} bytes exceeds limit"
        )));
    }

    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|e| ShmError::Worker(format!("reading arguments: {e}")))?;
    codec.decode(&payload)
}
