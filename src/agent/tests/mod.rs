use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::agent::Agent;
use crate::agent::config::{AgentConfig, AgentHome};
use crate::console::protocol::{
    DistributeFileMessage, RegisterMessage, ReportMessage, ReportState, StartMessage, WireMessage,
    read_message, send_message,
};
use crate::error::{AgentError, AgentResult};
use crate::properties::Properties;


const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const RUN_TIMEOUT: Duration = Duration::from_secs(20);

fn run_async_test<F>(future: F) -> AgentResult<()>
where
    F: std::future::Future<Output = AgentResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(future)
}

fn allocate_port() -> AgentResult<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Minimal in-process console: accepts one agent link at a time and speaks
/// the wire protocol directly.
struct FakeConsole {
    listener: TcpListener,
    port: u16,
}

impl FakeConsole {
    async fn bind() -> AgentResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn accept(&self) -> AgentResult<ConsoleLink> {
        let (stream, _) = tokio::time::timeout(ACCEPT_TIMEOUT, self.listener.accept())
            .await
            .map_err(|err| {
                AgentError::config(format!("Timed out waiting for an agent connection: {}", err))
            })??;
        let (read_half, write_half) = stream.into_split();
        Ok(ConsoleLink {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Asserts that no agent connects within `window`.
    async fn expect_no_connection(&self, window: Duration) -> AgentResult<()> {
        match tokio::time::timeout(window, self.listener.accept()).await {
            Err(_) => Ok(()),
            Ok(_) => Err(AgentError::config(
                "Unexpected agent connection to this console",
            )),
        }
    }
}

struct ConsoleLink {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ConsoleLink {
    async fn send(&mut self, message: &WireMessage) -> AgentResult<()> {
        send_message(&mut self.writer, message).await
    }

    async fn read(&mut self) -> AgentResult<WireMessage> {
        tokio::time::timeout(READ_TIMEOUT, read_message(&mut self.reader))
            .await
            .map_err(|err| {
                AgentError::config(format!("Timed out reading from the agent: {}", err))
            })?
    }

    async fn expect_register(&mut self) -> AgentResult<RegisterMessage> {
        match self.read().await? {
            WireMessage::Register(register) => Ok(register),
            other => Err(AgentError::config(format!(
                "Expected registration, got {:?}",
                other
            ))),
        }
    }

    /// Reads process reports until one with `state` arrives (inclusive),
    /// returning every report seen on the way. Non-report traffic fails.
    async fn reports_until(&mut self, state: ReportState) -> AgentResult<Vec<ReportMessage>> {
        let mut reports = Vec::new();
        loop {
            match self.read().await? {
                WireMessage::Report(report) => {
                    let done = report.state == state;
                    reports.push(report);
                    if done {
                        return Ok(reports);
                    }
                }
                other => {
                    return Err(AgentError::config(format!(
                        "Expected a process report, got {:?}",
                        other
                    )));
                }
            }
        }
    }

    async fn expect_report(&mut self, state: ReportState) -> AgentResult<ReportMessage> {
        let mut reports = self.reports_until(state).await?;
        reports
            .pop()
            .ok_or_else(|| AgentError::config("Expected at least one report"))
    }
}

fn count_state(reports: &[ReportMessage], state: ReportState) -> usize {
    reports
        .iter()
        .filter(|report| report.state == state)
        .count()
}

fn distribute(path: &str, contents: &[u8], high_water_mark: u64) -> WireMessage {
    use base64::Engine;
    WireMessage::DistributeFile(Box::new(DistributeFileMessage {
        path: path.to_owned(),
        contents_b64: base64::engine::general_purpose::STANDARD.encode(contents),
        high_water_mark,
    }))
}

fn start(pairs: &[(&str, &str)], agent_number: i32) -> WireMessage {
    let mut properties = BTreeMap::new();
    for (key, value) in pairs {
        properties.insert((*key).to_owned(), (*value).to_owned());
    }
    WireMessage::Start(Box::new(StartMessage {
        properties,
        agent_number,
    }))
}

/// Base properties for in-process worker runs against a console on `port`.
fn console_properties(port: u16) -> Properties {
    let mut properties = Properties::new();
    properties.set("grinder.consoleHost", "127.0.0.1");
    properties.set("grinder.consolePort", &port.to_string());
    properties.set("grinder.debug.singleprocess", "true");
    properties.set("grinder.processes", "1");
    properties
}

fn test_agent(
    home: &Path,
    properties: &Properties,
    proceed_without_console: bool,
) -> AgentResult<Arc<Agent>> {
    let home = AgentHome::new(home).map_err(AgentError::config)?;
    let config = AgentConfig::new(home, properties.clone());
    Ok(Arc::new(Agent::new(config, proceed_without_console)))
}

fn spawn_run(
    agent: &Arc<Agent>,
    properties: Properties,
) -> tokio::task::JoinHandle<AgentResult<()>> {
    let agent = Arc::clone(agent);
    tokio::spawn(async move { agent.run(properties).await })
}

async fn join_run(handle: tokio::task::JoinHandle<AgentResult<()>>) -> AgentResult<()> {
    tokio::time::timeout(RUN_TIMEOUT, handle)
        .await
        .map_err(|err| AgentError::config(format!("Agent run did not terminate: {}", err)))??
}
