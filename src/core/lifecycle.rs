use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use tokio::task::AbortHandle;

use super::{
    rtu::RtuRuntime,
    shutdown::{shutdown_channel, ShutdownTrigger},
    tcp::TcpRuntime,
};
use crate::api::config::{validate, RtuConfig, TcpConfig};

/// Bounded wait for each worker during [`ModbusServer::stop`].
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(20);
const ABORT_GRACE: Duration = Duration::from_secs(1);

struct Worker {
    name: &'static str,
    thread: JoinHandle<()>,
    done: oneshot::Receiver<()>,
    /// Only the TCP worker runs an abortable task.
    abort: Option<AbortHandle>,
}

/// Owns the transport workers and their shared shutdown signal.
///
/// Several servers may coexist in one process as long as their
/// transports do not collide.
pub struct ModbusServer {
    trigger: Option<ShutdownTrigger>,
    tcp: Option<Worker>,
    rtu: Option<Worker>,
    join_timeout: Duration,
}

impl Default for ModbusServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ModbusServer {
    pub fn new() -> Self {
        Self {
            trigger: None,
            tcp: None,
            rtu: None,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.tcp.is_some() || self.rtu.is_some()
    }

    /// Validate the configuration and spawn one worker per enabled
    /// transport.
    pub fn start(&mut self, tcp: TcpConfig, rtu: RtuConfig) -> Result<()> {
        if self.is_running() {
            return Err(anyhow!("Modbus server is already running"));
        }
        validate(&tcp, &rtu)?;
        if !tcp.enabled && !rtu.enabled {
            log::warn!("No transport enabled, nothing to serve");
        }

        let (trigger, token) = shutdown_channel();
        self.trigger = Some(trigger);

        if tcp.enabled {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build the TCP worker runtime")?;
            let task = runtime.spawn(TcpRuntime::new(tcp, token.clone()).run());
            let abort = task.abort_handle();
            let (done_tx, done) = oneshot::channel();

            let thread = thread::Builder::new()
                .name("mbsrv-tcp".to_string())
                .spawn(move || {
                    match runtime.block_on(task) {
                        Ok(()) => {}
                        Err(err) if err.is_cancelled() => log::warn!("TCP worker task aborted"),
                        Err(err) => log::error!("TCP worker task failed: {err}"),
                    }
                    drop(runtime);
                    let _ = done_tx.send(());
                })
                .context("Failed to spawn the TCP worker thread")?;

            self.tcp = Some(Worker {
                name: "TCP",
                thread,
                done,
                abort: Some(abort),
            });
        }

        if rtu.enabled {
            let runtime = RtuRuntime::new(rtu, token);
            let (done_tx, done) = oneshot::channel();

            let thread = thread::Builder::new()
                .name("mbsrv-rtu".to_string())
                .spawn(move || {
                    runtime.run();
                    let _ = done_tx.send(());
                })
                .context("Failed to spawn the RTU worker thread")?;

            self.rtu = Some(Worker {
                name: "RTU",
                thread,
                done,
                abort: None,
            });
        }

        log::info!("Modbus server started");
        Ok(())
    }

    /// Signal every worker and reclaim it within the join timeout.
    ///
    /// Safe to call when nothing is running.
    pub fn stop(&mut self) {
        let Some(mut trigger) = self.trigger.take() else {
            return;
        };
        trigger.cancel();

        for worker in [self.tcp.take(), self.rtu.take()].into_iter().flatten() {
            reclaim(worker, self.join_timeout);
        }
        log::info!("Modbus server stopped");
    }
}

impl Drop for ModbusServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reclaim(worker: Worker, timeout: Duration) {
    if finished(&worker.done, timeout) {
        join(worker);
        return;
    }

    match &worker.abort {
        Some(abort) => {
            log::warn!(
                "{} worker still running after {}s, aborting its task",
                worker.name,
                timeout.as_secs()
            );
            abort.abort();
            if finished(&worker.done, ABORT_GRACE) {
                join(worker);
            } else {
                log::warn!("{} worker ignored the abort, detaching it", worker.name);
            }
        }
        None => log::warn!(
            "{} worker still running after {}s, detaching it",
            worker.name,
            timeout.as_secs()
        ),
    }
}

/// A dropped sender means the thread is gone too.
fn finished(done: &oneshot::Receiver<()>, timeout: Duration) -> bool {
    !matches!(
        done.recv_timeout(timeout),
        Err(oneshot::RecvTimeoutError::Timeout)
    )
}

fn join(worker: Worker) {
    if worker.thread.join().is_err() {
        log::error!("{} worker panicked", worker.name);
    }
}
