use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Identifier of a chat participant. The broker treats it as an opaque key.
pub type UserId = String;

/// One chat event routed by the broker.
///
/// Messages are plain values: the broker moves or clones them but never
/// rewrites a field on the way to a mailbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub sender: UserId,
    /// Target of a unicast message. Ignored when `broadcast` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<UserId>,
    pub content: String,
    #[serde(default)]
    pub broadcast: bool,
    /// Logical send time chosen by the caller.
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    pub fn direct(
        sender: impl Into<UserId>,
        recipient: impl Into<UserId>,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: Some(recipient.into()),
            content: content.into(),
            broadcast: false,
            timestamp,
        }
    }

    pub fn broadcast(sender: impl Into<UserId>, content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            sender: sender.into(),
            recipient: None,
            content: content.into(),
            broadcast: true,
            timestamp,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.trim().is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
