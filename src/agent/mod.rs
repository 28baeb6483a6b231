//! The agent control loop.
//!
//! One long-lived task owns the state machine: connect to the console, wait
//! for a start signal, resolve the script, launch and supervise a worker
//! pool, drain it, and go around again until the console says otherwise (or
//! there is no console to ask).

pub(crate) mod command_line;
pub mod config;
pub(crate) mod file_store;
pub mod identity;
pub(crate) mod launcher;
pub(crate) mod listener;
pub(crate) mod property_builder;
pub(crate) mod script_location;
pub(crate) mod worker;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::console::connector::{ConnectionType, Connector, ConnectorFactory};
use crate::console::dispatch::FanOutSender;
use crate::console::protocol::StartMessage;
use crate::console::session::ConsoleSession;
use crate::error::{AgentError, AgentResult, ConfigError};
use crate::properties::{self, Properties};
use crate::sync::{EventCondition, lock_unpoisoned};

use command_line::{
    WorkerProcessCommandLine, filter_foremost_class_path, filter_system_class_path,
    join_class_path,
};
use config::AgentConfig;
use file_store::FileStore;
use identity::{AgentIdentity, local_host_name};
use launcher::WorkerLauncher;
use listener::{ConsoleListener, MessageMask};
use property_builder::PropertyBuilder;
use script_location::ScriptLocation;
use worker::{ProcessWorkerFactory, TaskWorkerFactory, WorkerFactory};

/// Grace granted after a console stop-class signal before live workers are
/// forcibly destroyed.
const MAXIMUM_SHUTDOWN_TIME: Duration = Duration::from_millis(5000);

pub struct Agent {
    config: AgentConfig,
    proceed_without_console: bool,
    identity: Mutex<AgentIdentity>,
    condition: Arc<EventCondition>,
    listener: Arc<ConsoleListener>,
    fan_out: Arc<FanOutSender>,
    connector_factory: ConnectorFactory,
    file_store: Mutex<Option<Arc<FileStore>>>,
    launcher: Mutex<Option<Arc<WorkerLauncher>>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    #[must_use]
    pub fn new(config: AgentConfig, proceed_without_console: bool) -> Self {
        let condition = Arc::new(EventCondition::new());
        Self {
            config,
            proceed_without_console,
            identity: Mutex::new(AgentIdentity::new(&local_host_name())),
            listener: Arc::new(ConsoleListener::new(Arc::clone(&condition))),
            condition,
            fan_out: Arc::new(FanOutSender::new()),
            connector_factory: ConnectorFactory::new(ConnectionType::Agent),
            file_store: Mutex::new(None),
            launcher: Mutex::new(None),
            timers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn identity(&self) -> AgentIdentity {
        lock_unpoisoned(&self.identity).clone()
    }

    /// Runs the control loop to termination, then releases every resource
    /// the loop acquired.
    ///
    /// # Errors
    ///
    /// Returns an error when the console is unreachable (and proceeding
    /// without it is not allowed), or on an unrecoverable session failure.
    pub async fn run(&self, base_properties: Properties) -> AgentResult<()> {
        let mut session: Option<ConsoleSession> = None;
        let result = self.message_loop(&base_properties, &mut session).await;
        if let Err(err) = &result {
            error!("Error in the agent control loop: {}", err);
        }

        self.abort_timers();
        if let Some(session) = session.take() {
            session.shutdown().await;
        }
        self.fan_out.shutdown();
        self.listener.shutdown();
        info!("Agent finished");
        result
    }

    /// External termination entry point. Idempotent; safe to race with
    /// normal loop termination.
    pub fn shutdown(&self) {
        self.abort_timers();
        self.fan_out.shutdown();
        self.listener.shutdown();
        let launcher = lock_unpoisoned(&self.launcher).clone();
        if let Some(launcher) = launcher {
            if !launcher.all_finished() {
                launcher.destroy_all_workers();
            }
        }
        info!("Agent termination requested");
    }

    async fn message_loop(
        &self,
        base_properties: &Properties,
        session_slot: &mut Option<ConsoleSession>,
    ) -> AgentResult<()> {
        let mut start_message: Option<StartMessage> = None;

        'outer: loop {
            info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

            let prepared = self
                .prepare_run(base_properties, &mut start_message, session_slot)
                .await?;

            let mut console_terminal = false;
            if let Prepared::Run {
                mut properties,
                script,
            } = prepared
            {
                console_terminal = self.run_test(&mut properties, &script).await?;
            }

            if session_slot.is_none() {
                debug!("No console session; terminating");
                break 'outer;
            }
            if console_terminal {
                debug!("Console requested termination during the run");
                break 'outer;
            }

            // A start that arrived while we were running is stale.
            self.listener.discard_messages(MessageMask::START);

            if !self.listener.received(MessageMask::ANY) {
                debug!("Test finished; waiting for console signal");
                self.await_console_signal(session_slot).await;
                if session_slot.as_ref().is_some_and(ConsoleSession::is_dead) {
                    debug!("Console session failed; reconnecting");
                    self.shutdown_session(session_slot).await;
                    start_message = None;
                    continue 'outer;
                }
            }

            if self.listener.received(MessageMask::START) {
                start_message = self.listener.last_start_message();
            } else if self
                .listener
                .check_for_message(MessageMask::STOP | MessageMask::SHUTDOWN)
            {
                debug!("Received a shutdown signal");
                break 'outer;
            } else {
                debug!("Awaiting a new start signal");
                self.listener.discard_messages(MessageMask::ANY);
                start_message = None;
            }
        }
        Ok(())
    }

    /// Merges properties, reconciles the console session against the desired
    /// connector, waits for a start signal when one is needed, and resolves
    /// the script.
    async fn prepare_run(
        &self,
        base_properties: &Properties,
        start_message: &mut Option<StartMessage>,
        session_slot: &mut Option<ConsoleSession>,
    ) -> AgentResult<Prepared> {
        loop {
            let mut properties = base_properties.clone();
            if let Some(message) = start_message.as_ref() {
                properties.put_all(&Properties::from_map(message.properties.clone()));
            }
            if self.config.property_bool(config::USE_SAME_CONSOLE, true) {
                if let Some(host) = self.config.property(config::CONTROLLER_SERVER_HOST) {
                    let host = host.to_owned();
                    properties.set(properties::CONSOLE_HOST, &host);
                }
            }
            {
                let mut identity = lock_unpoisoned(&self.identity);
                let host_name = identity.host_name.clone();
                identity.name = properties.get_or("grinder.hostID", &host_name);
            }

            let connector = if properties.get_bool("grinder.useConsole", true) {
                Some(self.connector_factory.create(&properties))
            } else {
                None
            };

            // Reconnect only when the connection details changed or the
            // session died; any pending start message survives the rebuild.
            let rebuild = match (session_slot.as_ref(), connector.as_ref()) {
                (Some(session), Some(connector)) => {
                    session.connector() != connector || session.is_dead()
                }
                (Some(_), None) => true,
                _ => false,
            };
            if rebuild {
                self.shutdown_session(session_slot).await;
            }

            if session_slot.is_none() {
                if let Some(connector) = connector {
                    match self.open_session(connector).await {
                        Ok(session) => {
                            session.start();
                            info!("Connected to console at {}", session.connector().endpoint());
                            *session_slot = Some(session);
                        }
                        Err(AgentError::Communication(err)) => {
                            if self.proceed_without_console {
                                warn!(
                                    "{}; proceeding without the console (set grinder.useConsole=false to disable this warning)",
                                    err
                                );
                            } else {
                                error!("{}", err);
                                return Err(AgentError::Communication(err));
                            }
                        }
                        Err(err) => {
                            error!("Failed to establish the console session: {}", err);
                            return Err(err);
                        }
                    }
                }
            }

            if session_slot.is_some() && start_message.is_none() {
                info!("Waiting for console signal");
                self.await_console_signal(session_slot).await;
                if session_slot
                    .as_ref()
                    .is_some_and(ConsoleSession::is_dead)
                {
                    self.shutdown_session(session_slot).await;
                    continue;
                }
                if self.listener.received(MessageMask::START) {
                    *start_message = self.listener.last_start_message();
                    continue;
                }
                // Some other signal: let the outer loop dispatch it.
                return Ok(Prepared::NoScript);
            }

            let mut script = None;
            if let Some(message) = start_message.as_ref() {
                let file_store = lock_unpoisoned(&self.file_store).clone();
                let Some(file_store) = file_store else {
                    error!("{}; ignoring", ConfigError::MissingFileStore);
                    *start_message = None;
                    return Ok(Prepared::NoScript);
                };

                let mut message_properties = Properties::from_map(message.properties.clone());
                message_properties.set_associated_directory(file_store.directory().to_path_buf());
                let console_script = message_properties.resolve_relative_file(
                    &message_properties.get_file(properties::SCRIPT, properties::DEFAULT_SCRIPT),
                );

                // Fall back to the agent's own script only when the start
                // message names none and no distributed default is readable.
                if message_properties.contains_key(properties::SCRIPT)
                    || file_readable(&console_script)
                {
                    script = Some(ScriptLocation::new(file_store.directory(), &console_script));
                }
                lock_unpoisoned(&self.identity).number = message.agent_number;
            } else {
                lock_unpoisoned(&self.identity).number = -1;
            }

            let script = script.unwrap_or_else(|| {
                let script_file = properties
                    .resolve_relative_file(&properties.get_file(properties::SCRIPT, properties::DEFAULT_SCRIPT));
                ScriptLocation::from_file(&script_file)
            });

            debug!("Script location: {}", script);
            if !script.is_readable() {
                error!(
                    "{}",
                    ConfigError::UnreadableScript {
                        path: script.file().to_path_buf()
                    }
                );
                return Ok(Prepared::NoScript);
            }

            return Ok(Prepared::Run { properties, script });
        }
    }

    /// Launches the worker pool for one run and blocks until it drains.
    /// Returns true when the console signalled `STOP` or `SHUTDOWN` while
    /// the pool was live.
    async fn run_test(
        &self,
        properties: &mut Properties,
        script: &ScriptLocation,
    ) -> AgentResult<bool> {
        if !properties.contains_key(properties::LOG_DIRECTORY) {
            let log_directory = self
                .config
                .home()
                .log_directory()
                .join(properties.get_or("grinder.test.id", "default"));
            properties.set_file(properties::LOG_DIRECTORY, &log_directory);
        }
        let jvm_arguments = self.build_test_run_properties(properties, script);

        let agent_name = lock_unpoisoned(&self.identity).name.clone();
        let factory: Box<dyn WorkerFactory> =
            if properties.get_bool("grinder.debug.singleprocess", false) {
                info!("Debug mode: spawning in-process tasks rather than worker processes");
                if !jvm_arguments.is_empty() {
                    warn!(
                        "Worker runtime arguments ({}) are ignored in single-process mode",
                        jvm_arguments
                    );
                }
                Box::new(TaskWorkerFactory::new(
                    &agent_name,
                    Arc::clone(&self.fan_out),
                    properties,
                ))
            } else {
                let system_class_path =
                    filter_system_class_path(&std::env::var("CLASSPATH").unwrap_or_default());
                let command_line = WorkerProcessCommandLine::new(
                    properties,
                    &system_class_path,
                    &jvm_arguments,
                    script.directory(),
                );
                info!("Worker process command line: {}", command_line);
                Box::new(ProcessWorkerFactory::new(
                    command_line,
                    &agent_name,
                    Arc::clone(&self.fan_out),
                    properties,
                    properties.get_file(properties::LOG_DIRECTORY, "."),
                ))
            };

        let pool_size = properties.get_int("grinder.processes", 1).max(0);
        let launcher = Arc::new(WorkerLauncher::new(
            pool_size as usize,
            factory,
            Arc::clone(&self.condition),
        ));
        *lock_unpoisoned(&self.launcher) = Some(Arc::clone(&launcher));

        let increment = properties.get_int("grinder.processIncrement", 0);
        if increment > 0 {
            let initial = properties.get_int("grinder.initialProcesses", increment).max(0);
            let more_to_start = launcher.start_some_workers(initial as usize)?;
            if more_to_start {
                let interval =
                    properties.get_int("grinder.processIncrementInterval", 60_000).max(1);
                let ramp = tokio::spawn(launcher::ramp_up(
                    Arc::clone(&launcher),
                    increment as usize,
                    Duration::from_millis(interval.unsigned_abs().into()),
                ));
                lock_unpoisoned(&self.timers).push(ramp);
            }
        } else {
            debug!("Starting all workers");
            launcher.start_all_workers()?;
        }

        let console_terminal = self.wait_for_pool(&launcher).await;

        debug!("Normal worker shutdown");
        launcher.shutdown().await;
        *lock_unpoisoned(&self.launcher) = None;
        Ok(console_terminal)
    }

    /// The RUNNING wait: blocks until every worker is terminal, granting
    /// [`MAXIMUM_SHUTDOWN_TIME`] after the first console signal before
    /// forcing termination.
    async fn wait_for_pool(&self, launcher: &WorkerLauncher) -> bool {
        let mut waiter = self.condition.subscribe();
        let mut console_signal_at: Option<Instant> = None;
        let mut console_terminal = false;

        while !launcher.all_finished() {
            debug!("Waiting until all workers are finished");
            if console_signal_at.is_none() {
                if self
                    .listener
                    .received(MessageMask::STOP | MessageMask::SHUTDOWN)
                {
                    console_terminal = true;
                }
                if self.listener.check_for_message(!MessageMask::START) {
                    info!("Worker start-up stopped by console signal");
                    launcher.dont_start_any_more();
                    console_signal_at = Some(Instant::now());
                }
            }
            if console_signal_at.is_some_and(|at| at.elapsed() > MAXIMUM_SHUTDOWN_TIME) {
                info!("Forcibly terminating unresponsive workers");
                launcher.destroy_all_workers();
            }
            waiter.wait_timeout(MAXIMUM_SHUTDOWN_TIME).await;
        }
        info!("All workers are finished");
        console_terminal
    }

    fn build_test_run_properties(
        &self,
        properties: &mut Properties,
        script: &ScriptLocation,
    ) -> String {
        let host_name = lock_unpoisoned(&self.identity).host_name.clone();
        let builder = PropertyBuilder::new(
            properties.clone(),
            script.directory(),
            properties.get_bool("grinder.security", false),
            properties.get("ngrinder.etc.hosts").map(str::to_owned),
            &host_name,
            self.config.property_bool(config::SERVER_MODE, false),
            self.config.property_bool(config::USE_XMX_LIMIT, true),
        );
        let jvm_arguments = builder.build_jvm_arguments();

        let foremost =
            filter_foremost_class_path(&std::env::var("CLASSPATH").unwrap_or_default());
        let rebased =
            builder.rebase_custom_class_path(&properties.get_or("grinder.jvm.classpath", ""));
        properties.set("grinder.jvm.classpath", &join_class_path([foremost, rebased]));

        info!("Run properties {}", properties);
        debug!("Worker runtime arguments {}", jvm_arguments);

        // A duration-bounded run with no run count means "unbounded runs".
        if properties.contains_key("grinder.duration") && !properties.contains_key("grinder.runs")
        {
            properties.set("grinder.runs", "0");
        }
        jvm_arguments
    }

    async fn open_session(&self, connector: Connector) -> AgentResult<ConsoleSession> {
        let stream = connector
            .connect()
            .await
            .map_err(AgentError::communication)?;
        let file_store = self.ensure_file_store()?;
        let identity = lock_unpoisoned(&self.identity).clone();
        ConsoleSession::open(
            connector,
            stream,
            identity,
            file_store,
            &self.listener,
            &self.fan_out,
        )
    }

    /// At most one file store exists per agent process; it is created on the
    /// first successful console connection and lives until termination.
    fn ensure_file_store(&self) -> AgentResult<Arc<FileStore>> {
        let mut slot = lock_unpoisoned(&self.file_store);
        if let Some(store) = slot.as_ref() {
            return Ok(Arc::clone(store));
        }
        let user = self.config.properties().get_or("grinder.user", "_default");
        let directory = self.config.home().file_store_directory(&user);
        let store = Arc::new(FileStore::new(&directory).map_err(AgentError::file_store)?);
        *slot = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Waits until the listener holds any message or the session dies.
    async fn await_console_signal(&self, session_slot: &Option<ConsoleSession>) {
        match session_slot.as_ref() {
            Some(session) => {
                tokio::select! {
                    () = self.listener.wait_for_message() => {}
                    () = session.died() => {}
                }
            }
            None => self.listener.wait_for_message().await,
        }
    }

    async fn shutdown_session(&self, session_slot: &mut Option<ConsoleSession>) {
        if let Some(session) = session_slot.take() {
            session.shutdown().await;
        }
        self.listener.discard_messages(MessageMask::ANY);
    }

    fn abort_timers(&self) {
        let timers: Vec<JoinHandle<()>> = lock_unpoisoned(&self.timers).drain(..).collect();
        for timer in timers {
            timer.abort();
        }
    }
}

enum Prepared {
    Run {
        properties: Properties,
        script: ScriptLocation,
    },
    NoScript,
}

fn file_readable(path: &Path) -> bool {
    std::fs::File::open(path).is_ok()
}
