use serde::{Deserialize, Serialize};

/// Who this agent is, as reported to the console.
///
/// `name` defaults to the local host name and may be overridden per run by
/// `grinder.hostID`; `number` is assigned by each start message and is `-1`
/// when running stand-alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub host_name: String,
    pub name: String,
    pub number: i32,
}

impl AgentIdentity {
    #[must_use]
    pub fn new(host_name: &str) -> Self {
        Self {
            host_name: host_name.to_owned(),
            name: host_name.to_owned(),
            number: -1,
        }
    }
}

#[must_use]
pub fn local_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned())
}
