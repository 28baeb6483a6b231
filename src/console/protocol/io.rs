use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AgentError, AgentResult, CommunicationError};

use super::types::{WireMessage, WorkerMessage};

const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

pub(crate) async fn read_message<R>(reader: &mut R) -> AgentResult<WireMessage>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    let bytes = reader.read_until(b'\n', &mut buffer).await.map_err(|err| {
        AgentError::communication(CommunicationError::Io {
            context: "read wire message",
            source: err,
        })
    })?;
    if bytes == 0 {
        return Err(AgentError::communication(
            CommunicationError::ConnectionClosed,
        ));
    }
    if buffer.len() > MAX_MESSAGE_BYTES {
        return Err(AgentError::communication(
            CommunicationError::MessageTooLarge {
                max_bytes: MAX_MESSAGE_BYTES,
            },
        ));
    }
    if buffer.ends_with(b"\n") {
        buffer.pop();
        if buffer.ends_with(b"\r") {
            buffer.pop();
        }
    }
    let line = std::str::from_utf8(&buffer).map_err(|err| {
        AgentError::communication(CommunicationError::MessageInvalidUtf8 { source: err })
    })?;
    serde_json::from_str::<WireMessage>(line).map_err(|err| {
        AgentError::communication(CommunicationError::Deserialize {
            context: "wire message",
            source: err,
        })
    })
}

pub(crate) async fn send_message<W>(writer: &mut W, message: &WireMessage) -> AgentResult<()>
where
    W: AsyncWrite + Unpin,
{
    write_json_line(writer, message, "wire message").await
}

pub(crate) async fn send_worker_message<W>(writer: &mut W, message: &WorkerMessage) -> AgentResult<()>
where
    W: AsyncWrite + Unpin,
{
    write_json_line(writer, message, "worker message").await
}

async fn write_json_line<W, T>(writer: &mut W, message: &T, context: &'static str) -> AgentResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut payload = serde_json::to_string(message).map_err(|err| {
        AgentError::communication(CommunicationError::Serialize {
            context,
            source: err,
        })
    })?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await.map_err(|err| {
        AgentError::communication(CommunicationError::Io {
            context,
            source: err,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentResult;

    fn run_async_test<F>(future: F) -> AgentResult<()>
    where
        F: std::future::Future<Output = AgentResult<()>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(future)
    }

    #[test]
    fn wire_messages_round_trip_over_a_duplex_stream() -> AgentResult<()> {
        run_async_test(async {
            let (client, server) = tokio::io::duplex(4096);
            let (server_read, _server_write) = tokio::io::split(server);
            let (_client_read, mut client_write) = tokio::io::split(client);

            send_message(&mut client_write, &WireMessage::Stop).await?;
            send_message(
                &mut client_write,
                &WireMessage::Start(Box::new(super::super::types::StartMessage {
                    properties: std::collections::BTreeMap::new(),
                    agent_number: 3,
                })),
            )
            .await?;

            let mut reader = tokio::io::BufReader::new(server_read);
            assert!(matches!(read_message(&mut reader).await?, WireMessage::Stop));
            match read_message(&mut reader).await? {
                WireMessage::Start(start) => assert_eq!(start.agent_number, 3),
                other => panic!("expected start message, got {:?}", other),
            }
            Ok(())
        })
    }

    #[test]
    fn closed_stream_reports_connection_closed() -> AgentResult<()> {
        run_async_test(async {
            let (client, server) = tokio::io::duplex(64);
            drop(client);
            let (server_read, _server_write) = tokio::io::split(server);
            let mut reader = tokio::io::BufReader::new(server_read);
            let result = read_message(&mut reader).await;
            assert!(result.is_err());
            Ok(())
        })
    }
}
