//! Host end of the connection to one worker process.

use std::io::{self, BufRead, BufReader};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use crate::config::Command;
use crate::error::{Error, Result};
use crate::protocol::{
    self, Envelope, Handshake, Reply, Request, Response, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
    MAX_FRAME_LEN,
};

/// Kills a worker from outside the thread that is talking to it.
///
/// Killing closes the worker's stdout, so a call blocked on the channel returns with a
/// transport error.
#[derive(Clone)]
pub struct Killer {
    pid: u32,
    child: Arc<Mutex<Child>>,
}

impl Killer {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn kill(&self) {
        let mut child = self.child.lock();
        if let Err(e) = child.kill() {
            tracing::trace!(pid = self.pid, error = %e, "kill failed, worker already gone");
        }
        let _ = child.wait();
    }
}

/// A running worker plus the pipes used to talk to it.
///
/// Frames from the worker's stdout are read on a dedicated thread so every wait can be
/// bounded by a timeout. Dropping the channel kills the worker.
pub struct Channel {
    pid: u32,
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    frames: Receiver<io::Result<Vec<u8>>>,
    next_id: u64,
}

impl Channel {
    /// Spawns the worker and waits up to `command.start_timeout` for its handshake.
    pub fn spawn(command: &Command) -> Result<Self> {
        let mut child = std::process::Command::new(&command.bin_path)
            .args(&command.args)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Startup(format!("{}: {e}", command.bin_path.display())))?;

        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Startup("worker pipes were not captured".into()));
        };

        let (tx, frames) = crossbeam_channel::unbounded();
        let reader = thread::Builder::new()
            .name(format!("sandpix-reader-{pid}"))
            .spawn(move || {
                let mut stdout = BufReader::new(stdout);
                loop {
                    match protocol::read_frame(&mut stdout) {
                        Ok(Some(frame)) => {
                            if tx.send(Ok(frame)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
            });

        let logger = thread::Builder::new()
            .name(format!("sandpix-stderr-{pid}"))
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => tracing::debug!(target: "sandpix::worker", pid, "{line}"),
                        Err(_) => break,
                    }
                }
            });

        if let Err(e) = reader.and(logger) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Startup(format!("spawning pipe threads: {e}")));
        }

        let mut channel = Self {
            pid,
            child: Arc::new(Mutex::new(child)),
            stdin,
            frames,
            next_id: 0,
        };
        channel.await_handshake(command.start_timeout)?;

        tracing::debug!(pid, "worker handshake complete");
        Ok(channel)
    }

    fn await_handshake(&mut self, timeout: Duration) -> Result<()> {
        let frame = match self.frames.recv_timeout(timeout) {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => return Err(Error::Handshake(format!("unreadable handshake: {e}"))),
            Err(RecvTimeoutError::Timeout) => {
                return Err(Error::Startup(format!(
                    "timeout while waiting for worker to start after {timeout:?}"
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let status = self
                    .child
                    .lock()
                    .wait()
                    .map(|status| status.to_string())
                    .unwrap_or_else(|e| e.to_string());
                return Err(Error::Startup(format!(
                    "worker exited before completing the handshake ({status})"
                )));
            }
        };

        let handshake: Handshake = rmp_serde::from_slice(&frame)
            .map_err(|e| Error::Handshake(format!("malformed handshake: {e}")))?;
        handshake.verify()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn killer(&self) -> Killer {
        Killer {
            pid: self.pid,
            child: Arc::clone(&self.child),
        }
    }

    /// Sends one request and waits for its reply. `None` waits indefinitely.
    ///
    /// Transport errors and timeouts leave the channel unusable; the caller must drop it.
    /// A request too large to frame is refused before anything is written.
    pub fn call(&mut self, request: &Request, timeout: Option<Duration>) -> Result<Response> {
        self.next_id += 1;
        let id = self.next_id;

        let payload = protocol::to_bounded_payload(&Envelope { id, body: request }, MAX_FRAME_LEN)?;
        protocol::write_frame(&mut self.stdin, &payload)?;

        let frame = match timeout {
            Some(timeout) => self.frames.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => Error::Timeout(timeout),
                RecvTimeoutError::Disconnected => worker_gone(),
            })?,
            None => self.frames.recv().map_err(|_| worker_gone())?,
        }?;

        let reply: Envelope<Reply> = protocol::from_payload(&frame)?;
        if reply.id != id {
            return Err(Error::Transport(format!(
                "received reply to call {} while waiting for call {id}",
                reply.id
            )));
        }

        reply.body.map_err(Error::from)
    }
}

fn worker_gone() -> Error {
    Error::Transport("worker closed its output".into())
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.killer().kill();
    }
}
