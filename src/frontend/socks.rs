//! SOCKS4/4a and SOCKS5 front end (`CONNECT` only)

use super::Handoff;
use crate::address::Address;
use crate::context::{BoxedStream, ConnectionContext, Outbound};
use crate::error::{ProxyError, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const SOCKS4: u8 = 0x04;
const SOCKS5: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

const SOCKS4_GRANTED: u8 = 0x5a;
const SOCKS4_REJECTED: u8 = 0x5b;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_PASSWORD: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const PASSWORD_AUTH_VERSION: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Longest user id / domain accepted in a SOCKS4 request
const MAX_SOCKS4_FIELD: usize = 255;

pub struct SocksFrontend {
    ctx: ConnectionContext,
}

impl SocksFrontend {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self { ctx }
    }

    pub async fn accept(&self, mut client: BoxedStream) -> Result<Option<Handoff>> {
        let version = match client.read_u8().await {
            Ok(version) => version,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match version {
            SOCKS4 => self.socks4(client).await.map(Some),
            SOCKS5 => self.socks5(client).await.map(Some),
            other => Err(ProxyError::protocol(format!("unknown SOCKS version {}", other))),
        }
    }

    async fn socks4(&self, mut client: BoxedStream) -> Result<Handoff> {
        let command = client.read_u8().await?;
        let port = client.read_u16().await?;
        let mut ip = [0u8; 4];
        client.read_exact(&mut ip).await?;
        let _user_id = read_nul_terminated(&mut client).await?;

        // 0.0.0.x with x != 0 announces a SOCKS4a domain name
        let host = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
            read_nul_terminated(&mut client).await?
        } else {
            Ipv4Addr::from(ip).to_string()
        };

        if command != CMD_CONNECT {
            socks4_reply(&mut client, SOCKS4_REJECTED).await?;
            return Err(ProxyError::protocol(format!("unsupported SOCKS4 command {}", command)));
        }

        let address = Address::new(host, port);
        debug!(target = %address, "{} : SOCKS4 CONNECT", self.ctx);
        match self.connect(address).await {
            Ok(server) => {
                socks4_reply(&mut client, SOCKS4_GRANTED).await?;
                Ok(Handoff::Tunnel { client, server })
            }
            Err(e) => {
                let _ = socks4_reply(&mut client, SOCKS4_REJECTED).await;
                Err(e)
            }
        }
    }

    async fn socks5(&self, mut client: BoxedStream) -> Result<Handoff> {
        let count = client.read_u8().await? as usize;
        let mut methods = vec![0u8; count];
        client.read_exact(&mut methods).await?;

        let method = if methods.contains(&METHOD_NO_AUTH) {
            METHOD_NO_AUTH
        } else if methods.contains(&METHOD_PASSWORD) {
            METHOD_PASSWORD
        } else {
            METHOD_NONE_ACCEPTABLE
        };
        client.write_all(&[SOCKS5, method]).await?;
        client.flush().await?;

        match method {
            METHOD_NONE_ACCEPTABLE => {
                return Err(ProxyError::protocol("no acceptable SOCKS5 auth method"));
            }
            // Credentials are read and accepted as is
            METHOD_PASSWORD => {
                let _version = client.read_u8().await?;
                let user_len = client.read_u8().await? as usize;
                let mut user = vec![0u8; user_len];
                client.read_exact(&mut user).await?;
                let password_len = client.read_u8().await? as usize;
                let mut password = vec![0u8; password_len];
                client.read_exact(&mut password).await?;
                client.write_all(&[PASSWORD_AUTH_VERSION, 0x00]).await?;
                client.flush().await?;
            }
            _ => {}
        }

        let mut head = [0u8; 4];
        client.read_exact(&mut head).await?;
        let [version, command, _reserved, address_type] = head;
        if version != SOCKS5 {
            return Err(ProxyError::protocol(format!("bad SOCKS5 request version {}", version)));
        }
        let host = match address_type {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                client.read_exact(&mut ip).await?;
                Ipv4Addr::from(ip).to_string()
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                client.read_exact(&mut ip).await?;
                Ipv6Addr::from(ip).to_string()
            }
            ATYP_DOMAIN => {
                let len = client.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                client.read_exact(&mut name).await?;
                String::from_utf8(name)
                    .map_err(|_| ProxyError::protocol("SOCKS5 domain is not UTF-8"))?
            }
            other => {
                return Err(ProxyError::protocol(format!("unknown SOCKS5 address type {}", other)));
            }
        };
        let port = client.read_u16().await?;

        if command != CMD_CONNECT {
            socks5_reply(&mut client, REP_COMMAND_NOT_SUPPORTED).await?;
            return Err(ProxyError::protocol(format!("unsupported SOCKS5 command {}", command)));
        }

        let address = Address::new(host, port);
        debug!(target = %address, "{} : SOCKS5 CONNECT", self.ctx);
        match self.connect(address).await {
            Ok(server) => {
                socks5_reply(&mut client, REP_SUCCEEDED).await?;
                Ok(Handoff::Tunnel { client, server })
            }
            Err(e) => {
                let _ = socks5_reply(&mut client, REP_HOST_UNREACHABLE).await;
                Err(e)
            }
        }
    }

    async fn connect(&self, address: Address) -> Result<BoxedStream> {
        match self.ctx.connect(address).await? {
            Outbound::Opened(stream) => Ok(stream),
            Outbound::Reused => Err(ProxyError::protocol("SOCKS CONNECT on an open tunnel")),
        }
    }
}

async fn read_nul_terminated<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut field = Vec::new();
    loop {
        match reader.read_u8().await? {
            0 => break,
            b if field.len() < MAX_SOCKS4_FIELD => field.push(b),
            _ => return Err(ProxyError::protocol("SOCKS4 field too long")),
        }
    }
    String::from_utf8(field).map_err(|_| ProxyError::protocol("SOCKS4 field is not UTF-8"))
}

async fn socks4_reply(client: &mut BoxedStream, status: u8) -> Result<()> {
    client.write_all(&[0x00, status, 0, 0, 0, 0, 0, 0]).await?;
    client.flush().await?;
    Ok(())
}

async fn socks5_reply(client: &mut BoxedStream, reply: u8) -> Result<()> {
    client
        .write_all(&[SOCKS5, reply, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    client.flush().await?;
    Ok(())
}
