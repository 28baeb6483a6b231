use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::identity::AgentIdentity;
use crate::console::connector::ConnectionType;

/// Messages exchanged with the console, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WireMessage {
    Register(RegisterMessage),
    Report(ReportMessage),
    Start(Box<StartMessage>),
    Stop,
    Reset,
    Shutdown,
    DistributeFile(Box<DistributeFileMessage>),
    ClearCache(ClearCacheMessage),
}

/// Identifies the agent to the console when the stream opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RegisterMessage {
    pub(crate) connection_type: ConnectionType,
    pub(crate) identity: AgentIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReportMessage {
    pub(crate) state: ReportState,
    pub(crate) cache_high_water_mark: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ReportState {
    Started,
    Running,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StartMessage {
    #[serde(default)]
    pub(crate) properties: BTreeMap<String, String>,
    #[serde(default = "default_agent_number")]
    pub(crate) agent_number: i32,
}

const fn default_agent_number() -> i32 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DistributeFileMessage {
    /// Path relative to the file store root.
    pub(crate) path: String,
    pub(crate) contents_b64: String,
    pub(crate) high_water_mark: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ClearCacheMessage {
    pub(crate) high_water_mark: u64,
}

/// Messages written to a worker's control stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WorkerMessage {
    Initialise(Box<InitialiseMessage>),
    Forward { message: Box<WireMessage> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct InitialiseMessage {
    pub(crate) worker_name: String,
    pub(crate) worker_number: usize,
    pub(crate) properties: BTreeMap<String, String>,
}
