//! Worker construction and supervision primitives.
//!
//! A worker is opaque to the agent: something that runs to termination and
//! can be destroyed. The process factory launches child processes from a
//! fixed command line and feeds each one control messages over stdin; the
//! task factory runs co-operative tasks in the agent's own address space and
//! exists for `grinder.debug.singleprocess` runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::console::dispatch::{FanOutEvent, FanOutSender};
use crate::console::protocol::{InitialiseMessage, WireMessage, WorkerMessage, send_worker_message};
use crate::error::{AgentResult, WorkerError};
use crate::properties::Properties;

use super::command_line::WorkerProcessCommandLine;

/// Exit code reported when a worker dies without one (signal or forced
/// termination).
pub(crate) const TERMINATED_EXIT_CODE: i32 = -1;

#[async_trait]
pub(crate) trait Worker: Send {
    fn name(&self) -> &str;

    /// Runs the worker to termination, returning its exit code. A `true` on
    /// `kill` forces termination; forcing is idempotent.
    async fn run(self: Box<Self>, kill: watch::Receiver<bool>) -> AgentResult<i32>;
}

pub(crate) trait WorkerFactory: Send + Sync {
    fn create(&self, worker_number: usize) -> AgentResult<Box<dyn Worker>>;
}

pub(crate) struct ProcessWorkerFactory {
    command_line: WorkerProcessCommandLine,
    agent_name: String,
    fan_out: Arc<FanOutSender>,
    properties: BTreeMap<String, String>,
    log_directory: PathBuf,
}

impl ProcessWorkerFactory {
    pub(crate) fn new(
        command_line: WorkerProcessCommandLine,
        agent_name: &str,
        fan_out: Arc<FanOutSender>,
        properties: &Properties,
        log_directory: PathBuf,
    ) -> Self {
        Self {
            command_line,
            agent_name: agent_name.to_owned(),
            fan_out,
            properties: properties.values().clone(),
            log_directory,
        }
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn create(&self, worker_number: usize) -> AgentResult<Box<dyn Worker>> {
        Ok(Box::new(ProcessWorker {
            name: format!("{}-{}", self.agent_name, worker_number),
            worker_number,
            command_line: self.command_line.clone(),
            properties: self.properties.clone(),
            log_directory: self.log_directory.clone(),
            control: self.fan_out.subscribe(),
        }))
    }
}

struct ProcessWorker {
    name: String,
    worker_number: usize,
    command_line: WorkerProcessCommandLine,
    properties: BTreeMap<String, String>,
    log_directory: PathBuf,
    control: mpsc::UnboundedReceiver<FanOutEvent>,
}

impl ProcessWorker {
    fn open_log(&self, extension: &str) -> Result<std::fs::File, WorkerError> {
        let path = self.log_directory.join(format!("{}.{}", self.name, extension));
        std::fs::File::create(&path).map_err(|err| WorkerError::Spawn {
            name: self.name.clone(),
            source: err,
        })
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(mut self: Box<Self>, mut kill: watch::Receiver<bool>) -> AgentResult<i32> {
        std::fs::create_dir_all(&self.log_directory).map_err(|err| WorkerError::LogDirectory {
            path: self.log_directory.clone(),
            source: err,
        })?;
        let stdout = self.open_log("out")?;
        let stderr = self.open_log("err")?;

        let command = self.command_line.command();
        let mut child = tokio::process::Command::new(&command[0])
            .args(&command[1..])
            .current_dir(self.command_line.working_directory())
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| WorkerError::Spawn {
                name: self.name.clone(),
                source: err,
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| WorkerError::MissingControlStream {
            name: self.name.clone(),
        })?;
        let initialise = WorkerMessage::Initialise(Box::new(InitialiseMessage {
            worker_name: self.name.clone(),
            worker_number: self.worker_number,
            properties: self.properties.clone(),
        }));
        let mut stdin = if send_worker_message(&mut stdin, &initialise).await.is_err() {
            debug!("Worker {} closed its control stream during initialise", self.name);
            None
        } else {
            Some(stdin)
        };

        let mut kill_requested = *kill.borrow();
        let mut kill_open = true;
        let mut kill_sent = false;
        let mut control_open = true;

        loop {
            if kill_requested && !kill_sent {
                if let Err(err) = child.start_kill() {
                    debug!("Worker {} already gone on destroy: {}", self.name, err);
                }
                kill_sent = true;
            }

            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|err| WorkerError::Wait {
                        name: self.name.clone(),
                        source: err,
                    })?;
                    return Ok(status.code().unwrap_or(TERMINATED_EXIT_CODE));
                }
                changed = kill.changed(), if kill_open => {
                    match changed {
                        Ok(()) => kill_requested = true,
                        Err(_) => kill_open = false,
                    }
                }
                event = self.control.recv(), if control_open => {
                    match event {
                        Some(FanOutEvent::Message(message)) => {
                            if let Some(stream) = stdin.as_mut() {
                                let forward = WorkerMessage::Forward {
                                    message: Box::new(message),
                                };
                                if send_worker_message(stream, &forward).await.is_err() {
                                    debug!("Worker {} control stream closed", self.name);
                                    stdin = None;
                                    control_open = false;
                                }
                            }
                        }
                        Some(FanOutEvent::Close) | None => {
                            stdin = None;
                            control_open = false;
                        }
                    }
                }
            }
        }
    }
}

pub(crate) struct TaskWorkerFactory {
    agent_name: String,
    fan_out: Arc<FanOutSender>,
    duration: Option<Duration>,
}

impl TaskWorkerFactory {
    pub(crate) fn new(agent_name: &str, fan_out: Arc<FanOutSender>, properties: &Properties) -> Self {
        let duration_ms = properties.get_int("grinder.duration", 0);
        let duration = if duration_ms > 0 {
            Some(Duration::from_millis(duration_ms.unsigned_abs().into()))
        } else {
            None
        };
        Self {
            agent_name: agent_name.to_owned(),
            fan_out,
            duration,
        }
    }
}

impl WorkerFactory for TaskWorkerFactory {
    fn create(&self, worker_number: usize) -> AgentResult<Box<dyn Worker>> {
        Ok(Box::new(TaskWorker {
            name: format!("{}-{}", self.agent_name, worker_number),
            duration: self.duration,
            control: self.fan_out.subscribe(),
        }))
    }
}

/// Co-operative stand-in for a worker process. Runs for the configured
/// duration, or until a stop-class message or control-stream close arrives.
struct TaskWorker {
    name: String,
    duration: Option<Duration>,
    control: mpsc::UnboundedReceiver<FanOutEvent>,
}

#[async_trait]
impl Worker for TaskWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(mut self: Box<Self>, mut kill: watch::Receiver<bool>) -> AgentResult<i32> {
        let deadline = self
            .duration
            .map(|duration| tokio::time::Instant::now() + duration);
        if *kill.borrow() {
            return Ok(TERMINATED_EXIT_CODE);
        }
        let mut kill_open = true;

        loop {
            tokio::select! {
                () = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => return Ok(0),
                changed = kill.changed(), if kill_open => {
                    match changed {
                        Ok(()) => {
                            if *kill.borrow() {
                                return Ok(TERMINATED_EXIT_CODE);
                            }
                        }
                        Err(_) => kill_open = false,
                    }
                }
                event = self.control.recv() => {
                    match event {
                        Some(FanOutEvent::Message(message)) => match message {
                            WireMessage::Stop | WireMessage::Reset | WireMessage::Shutdown => {
                                debug!("Worker {} stopping on console signal", self.name);
                                return Ok(0);
                            }
                            _ => {}
                        },
                        Some(FanOutEvent::Close) | None => {
                            warn!("Worker {} control stream closed; stopping", self.name);
                            return Ok(0);
                        }
                    }
                }
            }
        }
    }
}
