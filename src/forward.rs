//! Raw byte relay for protocols the proxy does not understand

use crate::context::{BoxedStream, ConnectionContext};
use crate::error::Result;
use crate::event::{ForwardEvent, ForwardEventBuilder};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const BUFFER_SIZE: usize = 16 * 1024;

#[derive(Clone, Copy)]
enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Copies bytes in both directions, showing every chunk to the listeners.
/// The connection ends as soon as either side closes.
pub struct ForwardEngine {
    ctx: ConnectionContext,
}

impl ForwardEngine {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self { ctx }
    }

    pub async fn run(self, client: BoxedStream, server: BoxedStream) -> Result<()> {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);
        let event = Mutex::new(ForwardEvent::builder(&self.ctx));

        let result = tokio::select! {
            r = self.relay(&mut client_read, &mut server_write, Direction::ClientToServer, &event) => r,
            r = self.relay(&mut server_read, &mut client_write, Direction::ServerToClient, &event) => r,
        };

        let _ = client_write.shutdown().await;
        let _ = server_write.shutdown().await;
        self.ctx.server_closed();

        let event = event.lock().unwrap_or_else(|e| e.into_inner()).build();
        self.ctx.listener().on_forward_event(&self.ctx, &event);
        debug!("{} : forward relay finished", self.ctx);
        result
    }

    async fn relay<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        direction: Direction,
        event: &Mutex<ForwardEventBuilder>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            let chunk = &buf[..n];
            {
                let mut event = event.lock().unwrap_or_else(|e| e.into_inner());
                match direction {
                    Direction::ClientToServer => event.add_request_body_size(n as u64),
                    Direction::ServerToClient => event.add_response_body_size(n as u64),
                };
            }
            match direction {
                Direction::ClientToServer => self.ctx.listener().on_forward_request(&self.ctx, chunk),
                Direction::ServerToClient => self.ctx.listener().on_forward_response(&self.ctx, chunk),
            }
            writer.write_all(chunk).await?;
            writer.flush().await?;
        }
    }
}
