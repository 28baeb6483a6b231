//! One connected console session.
//!
//! A session owns three tasks: an outbound writer draining a queue, an
//! inbound pump feeding the dispatch pipeline, and a periodic heartbeat.
//! Sessions are built against an already-connected stream and are torn down
//! idempotently.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::agent::file_store::FileStore;
use crate::agent::identity::AgentIdentity;
use crate::agent::listener::ConsoleListener;
use crate::error::{AgentError, AgentResult, CommunicationError};
use crate::sync::lock_unpoisoned;

use super::connector::Connector;
use super::dispatch::{
    FanOutSender, FanOutSink, IgnoreShutdownSink, MessageDispatcher, MessageSink, TeeSink,
};
use super::protocol::{
    RegisterMessage, ReportMessage, ReportState, WireMessage, read_message, send_message,
};

pub(crate) const AGENT_HEARTBEAT_DELAY: Duration = Duration::from_millis(1000);
pub(crate) const AGENT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct ConsoleSession {
    connector: Connector,
    file_store: Arc<FileStore>,
    out_tx: Mutex<Option<mpsc::UnboundedSender<WireMessage>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    dead: watch::Receiver<bool>,
}

impl ConsoleSession {
    /// Builds a session over `stream`: spawns the writer and pump, then
    /// queues the registration and the `STARTED` process report.
    pub(crate) fn open(
        connector: Connector,
        stream: TcpStream,
        identity: AgentIdentity,
        file_store: Arc<FileStore>,
        listener: &Arc<ConsoleListener>,
        fan_out: &Arc<FanOutSender>,
    ) -> AgentResult<Self> {
        let (read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(err) = send_message(&mut write_half, &message).await {
                    debug!("Console write failed: {}", err);
                    break;
                }
            }
        });

        // The file store consumes distribution traffic; everything else is
        // tee'd to our own listener and to the live workers.
        let mut dispatcher = MessageDispatcher::new();
        file_store.register_message_handlers(&mut dispatcher);
        let mut listener_dispatcher = MessageDispatcher::new();
        listener.register_message_handlers(&mut listener_dispatcher);
        dispatcher.set_fallback(Box::new(TeeSink::new(
            Box::new(listener_dispatcher),
            Box::new(IgnoreShutdownSink::new(FanOutSink(Arc::clone(fan_out)))),
        )));

        let (dead_tx, dead) = watch::channel(false);
        let pump = {
            let listener = Arc::clone(listener);
            let mut reader = BufReader::new(read_half);
            tokio::spawn(async move {
                loop {
                    match read_message(&mut reader).await {
                        Ok(message) => {
                            if let Err(err) = dispatcher.send(&message) {
                                if matches!(err, AgentError::FileStore(_)) {
                                    error!(
                                        "File store failure; abandoning the console session: {}",
                                        err
                                    );
                                    // A dead session is torn down and rebuilt
                                    // by the control loop; the listener's
                                    // shutdown bit stays reserved for a
                                    // closed link.
                                    if dead_tx.send(true).is_err() {
                                        debug!("Session already released");
                                    }
                                    break;
                                }
                                warn!("Failed to dispatch console message: {}", err);
                            }
                        }
                        Err(err) => {
                            debug!("Console link closed: {}", err);
                            listener.shutdown();
                            break;
                        }
                    }
                }
            })
        };

        let session = Self {
            connector,
            file_store,
            out_tx: Mutex::new(Some(out_tx)),
            writer: Mutex::new(Some(writer)),
            pump: Mutex::new(Some(pump)),
            heartbeat: Mutex::new(None),
            dead,
        };
        session.send(WireMessage::Register(RegisterMessage {
            connection_type: session.connector.connection_type(),
            identity,
        }))?;
        session.send(session.report(ReportState::Started))?;
        Ok(session)
    }

    /// Schedules the `RUNNING` heartbeat. A heartbeat failure cancels only
    /// the heartbeat, never the session.
    pub(crate) fn start(&self) {
        let Some(out_tx) = lock_unpoisoned(&self.out_tx).clone() else {
            return;
        };
        let file_store = Arc::clone(&self.file_store);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(AGENT_HEARTBEAT_DELAY).await;
            let mut ticker = tokio::time::interval(AGENT_HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let report = WireMessage::Report(ReportMessage {
                    state: ReportState::Running,
                    cache_high_water_mark: file_store.cache_high_water_mark(),
                });
                if out_tx.send(report).is_err() {
                    warn!("Heartbeat failed; cancelling the heartbeat");
                    break;
                }
            }
        });
        *lock_unpoisoned(&self.heartbeat) = Some(handle);
    }

    pub(crate) fn connector(&self) -> &Connector {
        &self.connector
    }

    /// True once the session hit a fatal error and must be rebuilt.
    pub(crate) fn is_dead(&self) -> bool {
        *self.dead.borrow()
    }

    /// Resolves when the session hits a fatal error; pends forever on a
    /// session that merely closed (the listener's shutdown bit covers that).
    pub(crate) async fn died(&self) {
        let mut dead = self.dead.clone();
        loop {
            if *dead.borrow() {
                return;
            }
            if dead.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Cancels the heartbeat, best-effort sends the `FINISHED` report, and
    /// stops the pump. Safe to call repeatedly.
    pub(crate) async fn shutdown(&self) {
        if let Some(heartbeat) = lock_unpoisoned(&self.heartbeat).take() {
            heartbeat.abort();
        }

        let out_tx = lock_unpoisoned(&self.out_tx).take();
        if let Some(out_tx) = out_tx {
            if out_tx.send(self.report(ReportState::Finished)).is_err() {
                debug!("Console already gone for the final report");
            }
            drop(out_tx);

            let writer = lock_unpoisoned(&self.writer).take();
            if let Some(writer) = writer {
                match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
                    Ok(Ok(())) => debug!("Final process report sent"),
                    Ok(Err(err)) => debug!("Console writer task failed: {}", err),
                    Err(_) => debug!("Timed out draining the console writer"),
                }
            }
        }

        if let Some(pump) = lock_unpoisoned(&self.pump).take() {
            pump.abort();
        }
    }

    fn report(&self, state: ReportState) -> WireMessage {
        WireMessage::Report(ReportMessage {
            state,
            cache_high_water_mark: self.file_store.cache_high_water_mark(),
        })
    }

    fn send(&self, message: WireMessage) -> AgentResult<()> {
        let guard = lock_unpoisoned(&self.out_tx);
        match guard.as_ref() {
            Some(out_tx) if out_tx.send(message).is_ok() => Ok(()),
            _ => Err(AgentError::communication(CommunicationError::ChannelClosed)),
        }
    }
}
