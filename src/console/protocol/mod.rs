mod io;
mod types;

pub(crate) use io::{read_message, send_message, send_worker_message};
pub(crate) use types::{
    ClearCacheMessage, DistributeFileMessage, InitialiseMessage, RegisterMessage, ReportMessage,
    ReportState, StartMessage, WireMessage, WorkerMessage,
};
