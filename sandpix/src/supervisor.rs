//! Worker lifecycle: start, health checks, the single restart, and teardown.

use parking_lot::Mutex;

use crate::channel::{Channel, Killer};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{Request, Response, PONG};
use crate::queue::CallQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Start,
    Ready,
    Fail,
    Stop,
}

impl WorkerState {
    /// The lifecycle transition table. `None` marks an illegal move.
    fn next(self, transition: Transition) -> Option<WorkerState> {
        use Transition::*;
        use WorkerState::*;

        match (self, transition) {
            (Stopped | Failed | Running, Start) => Some(Starting),
            (Starting, Ready) => Some(Running),
            (Starting, Fail) => Some(Failed),
            (_, Stop) => Some(Stopped),
            _ => None,
        }
    }
}

struct Worker {
    state: WorkerState,
    /// The idle channel. Taken out for the length of a call so the lock is not held
    /// while waiting on the worker.
    channel: Option<Channel>,
    /// Kill handle for the live worker, present even while its channel is checked out.
    killer: Option<Killer>,
    /// Present between a successful initialize and deinitialize.
    config: Option<Config>,
    restarts: u64,
    /// Bumped whenever the live worker is replaced or stopped. A checked-out channel
    /// whose generation no longer matches belongs to a dead worker.
    generation: u64,
}

impl Worker {
    fn transition(&mut self, transition: Transition) {
        match self.state.next(transition) {
            Some(next) => {
                tracing::trace!(from = %self.state, to = %next, "worker state change");
                self.state = next;
            }
            None => tracing::error!(state = %self.state, ?transition, "illegal worker transition"),
        }
    }

    fn release(&mut self) {
        self.channel = None;
        if let Some(killer) = self.killer.take() {
            tracing::debug!(pid = killer.pid(), "killing worker");
            killer.kill();
        }
        self.generation += 1;
    }

    /// Spawns a fresh worker, replacing any existing one, and hands out its channel.
    fn start(&mut self, config: &Config) -> Result<Channel> {
        self.release();
        self.transition(Transition::Start);

        match start_channel(config) {
            Ok(channel) => {
                tracing::info!(pid = channel.pid(), "worker running");
                self.killer = Some(channel.killer());
                self.transition(Transition::Ready);
                Ok(channel)
            }
            Err(e) => {
                self.transition(Transition::Fail);
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        self.release();
        self.transition(Transition::Stop);
    }
}

fn start_channel(config: &Config) -> Result<Channel> {
    let mut channel = Channel::spawn(&config.command)?;
    match probe(&mut channel, config) {
        Ok(()) => Ok(channel),
        Err(e @ (Error::Handshake(_) | Error::Startup(_))) => Err(e),
        Err(e) => Err(Error::Handshake(format!("initial ping failed: {e}"))),
    }
}

/// Liveness probe: a ping that must come back with the sentinel.
fn probe(channel: &mut Channel, config: &Config) -> Result<()> {
    match channel.call(&Request::Ping, config.ping_timeout)? {
        Response::Pong(pong) if pong == PONG => Ok(()),
        other => Err(Error::Handshake(format!("wrong ping/pong result: {other:?}"))),
    }
}

/// A reply of the wrong kind means the worker is confused; treat it like a broken pipe.
fn expect_reply(request: &Request, response: Response) -> Result<Response> {
    if request.accepts(&response) {
        Ok(response)
    } else {
        Err(Error::Transport(format!(
            "unexpected {} reply to {}",
            response.name(),
            request.name()
        )))
    }
}

/// A channel checked out of the supervisor for one call.
struct Lease {
    channel: Channel,
    config: Config,
    generation: u64,
}

/// Owns at most one worker process and hands out serialized access to it.
pub struct Supervisor {
    worker: Mutex<Worker>,
    queue: CallQueue,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            worker: Mutex::new(Worker {
                state: WorkerState::Stopped,
                channel: None,
                killer: None,
                config: None,
                restarts: 0,
                generation: 0,
            }),
            queue: CallQueue::new(0),
        }
    }

    /// Starts the worker. Does nothing if it is already running.
    ///
    /// On failure any previous configuration is forgotten as well.
    #[tracing::instrument(skip_all, fields(bin = %config.command.bin_path.display()))]
    pub fn initialize(&self, config: Config) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.state == WorkerState::Running && worker.config.is_some() {
            return Ok(());
        }

        self.queue.set_capacity(config.queue_capacity);
        match worker.start(&config) {
            Ok(channel) => {
                worker.channel = Some(channel);
                worker.config = Some(config);
                Ok(())
            }
            Err(e) => {
                worker.config = None;
                Err(e)
            }
        }
    }

    /// Kills the worker and forgets the configuration. Safe to call repeatedly, and
    /// does not wait for a call in progress: that call fails with a transport error.
    #[tracing::instrument(skip_all)]
    pub fn deinitialize(&self) {
        let mut worker = self.worker.lock();
        worker.stop();
        worker.config = None;
    }

    pub fn state(&self) -> WorkerState {
        self.worker.lock().state
    }

    /// Number of times the worker was restarted after a failed health check.
    pub fn restarts(&self) -> u64 {
        self.worker.lock().restarts
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.lock().killer.as_ref().map(Killer::pid)
    }

    /// Runs one request against a healthy worker.
    ///
    /// Callers are admitted in arrival order. Before the request is sent the worker is
    /// probed and, if the probe fails, restarted once. A worker that dies, times out or
    /// answers with the wrong kind of reply during the request is torn down and the
    /// error returned as-is; the next call brings up a replacement.
    #[tracing::instrument(skip_all, fields(op = request.name()))]
    pub fn call(&self, request: Request) -> Result<Response> {
        let _turn = self.queue.enter()?;
        let mut lease = self.check_out()?;

        let result = lease
            .channel
            .call(&request, lease.config.call_timeout)
            .and_then(|response| expect_reply(&request, response));

        self.check_in(lease, &result);
        result
    }

    /// Takes the channel of a responsive worker, restarting the worker at most once.
    fn check_out(&self) -> Result<Lease> {
        let (channel, config, generation) = {
            let mut worker = self.worker.lock();
            let config = worker.config.clone().ok_or(Error::NotInitialized)?;
            (worker.channel.take(), config, worker.generation)
        };

        match channel {
            Some(mut channel) => match probe(&mut channel, &config) {
                Ok(()) => {
                    return Ok(Lease {
                        channel,
                        config,
                        generation,
                    })
                }
                Err(e) => tracing::warn!(error = %e, "restarting worker due to failed liveness probe"),
            },
            None => tracing::info!("worker is not running, starting a replacement"),
        }

        let mut worker = self.worker.lock();
        let config = worker.config.clone().ok_or(Error::NotInitialized)?;
        if worker.generation != generation {
            // replaced by initialize while we were probing
            if let Some(channel) = worker.channel.take() {
                let generation = worker.generation;
                return Ok(Lease {
                    channel,
                    config,
                    generation,
                });
            }
        }

        worker.restarts += 1;
        match worker.start(&config) {
            Ok(channel) => Ok(Lease {
                channel,
                config,
                generation: worker.generation,
            }),
            Err(e) => {
                tracing::error!(error = %e, "could not restart worker");
                worker.stop();
                Err(Error::PluginUnavailable(e.to_string()))
            }
        }
    }

    fn check_in(&self, lease: Lease, result: &Result<Response>) {
        let mut worker = self.worker.lock();
        if worker.generation != lease.generation {
            tracing::debug!(pid = lease.channel.pid(), "dropping channel of a replaced worker");
            return;
        }

        match result {
            Err(e) if e.is_worker_fault() => {
                tracing::warn!(error = %e, "worker failed during call, tearing it down");
                worker.stop();
            }
            _ => worker.channel = Some(lease.channel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerState::*;

    #[test]
    fn transition_table() {
        assert_eq!(Stopped.next(Transition::Start), Some(Starting));
        assert_eq!(Failed.next(Transition::Start), Some(Starting));
        assert_eq!(Running.next(Transition::Start), Some(Starting));
        assert_eq!(Starting.next(Transition::Ready), Some(Running));
        assert_eq!(Starting.next(Transition::Fail), Some(Failed));
        for state in [Stopped, Starting, Running, Failed] {
            assert_eq!(state.next(Transition::Stop), Some(Stopped));
        }

        assert_eq!(Stopped.next(Transition::Ready), None);
        assert_eq!(Running.next(Transition::Fail), None);
        assert_eq!(Starting.next(Transition::Start), None);
    }

    #[test]
    fn failed_initialize_leaves_nothing_to_restart() {
        let supervisor = Supervisor::new();
        let config = Config::new(crate::config::Command::new("/nonexistent/sandpix-worker"));
        assert!(matches!(supervisor.initialize(config), Err(Error::Startup(_))));
        assert_eq!(supervisor.state(), Failed);
        assert!(matches!(supervisor.call(Request::Ping), Err(Error::NotInitialized)));
        assert_eq!(supervisor.restarts(), 0);
    }

    #[test]
    fn mismatched_reply_is_a_worker_fault() {
        let pong = Response::Pong(PONG.to_string());
        assert!(expect_reply(&Request::Ping, pong.clone()).is_ok());

        let err = expect_reply(&Request::DecodeConfig { data: vec![] }, pong).unwrap_err();
        assert!(err.is_worker_fault(), "{err}");
    }

    #[test]
    fn calls_before_initialize_are_rejected() {
        let supervisor = Supervisor::new();
        assert!(matches!(supervisor.call(Request::Ping), Err(Error::NotInitialized)));
        assert_eq!(supervisor.state(), Stopped);
        assert_eq!(supervisor.worker_pid(), None);

        // deinitialize without initialize is harmless
        supervisor.deinitialize();
        supervisor.deinitialize();
        assert_eq!(supervisor.state(), Stopped);
    }
}
