// ── Byte stream under the SCP state machine ───────────────────────────────────

use async_trait::async_trait;
use rssh_core::SshResult;
use rssh_ssh::ssh::{Channel, StreamKind};

/// Duplex byte stream the SCP protocol runs over.
#[async_trait]
pub trait ScpStream: Send {
    /// Up to `max` bytes; `None` once the remote has sent EOF.
    async fn read_chunk(&mut self, max: usize) -> SshResult<Option<Vec<u8>>>;

    async fn write_all(&mut self, data: &[u8]) -> SshResult<()>;

    async fn send_eof(&mut self) -> SshResult<()>;

    async fn close(&mut self) -> SshResult<()>;
}

#[async_trait]
impl ScpStream for Channel {
    async fn read_chunk(&mut self, max: usize) -> SshResult<Option<Vec<u8>>> {
        // with no timeout an empty read only happens at end of stream
        let data = self.read(max, StreamKind::Stdout, None).await?;
        if data.is_empty() {
            Ok(None)
        } else {
            Ok(Some(data))
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> SshResult<()> {
        Channel::write_all(self, data).await
    }

    async fn send_eof(&mut self) -> SshResult<()> {
        Channel::send_eof(self).await
    }

    async fn close(&mut self) -> SshResult<()> {
        Channel::close(self).await
    }
}
