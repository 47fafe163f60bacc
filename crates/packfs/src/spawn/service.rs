// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{MAX_REQUEST_SIZE, SpawnRequest, SpawnResponse};
use crate::supervisor::Supervisor;
use crate::{Error, Result, describe_chain};

/// Accepts spawn requests on an ephemeral loopback port.
#[derive(Debug)]
pub struct SpawnService {
    listener: TcpListener,
    address: SocketAddr,
}

impl SpawnService {
    /// Reserve a loopback port for the service.
    ///
    /// Nothing is accepted until [`Self::serve`] is called, but
    /// clients may already connect and will simply wait.
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(Error::ListenerError)?;
        let address = listener.local_addr().map_err(Error::ListenerError)?;
        tracing::debug!(%address, "spawn service bound");
        Ok(Self { listener, address })
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Answer requests until accepting a connection fails.
    pub async fn serve(self, supervisor: Arc<Supervisor>) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(%err, "spawn service stopped accepting connections");
                    return;
                }
            };
            tracing::trace!(%peer, "spawn connection accepted");
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, &supervisor).await {
                    tracing::warn!(%peer, "{}", describe_chain(&err));
                }
            });
        }
    }
}

async fn handle_connection(mut stream: TcpStream, supervisor: &Arc<Supervisor>) -> Result<()> {
    let (mut reader, mut writer) = stream.split();
    let response = match read_request(&mut reader).await {
        Ok(request) => {
            tracing::debug!(?request, "spawn requested");
            match supervisor.start(request.to_process_spec()).await {
                Ok(process) => SpawnResponse::started(process.pid()),
                Err(err) => {
                    tracing::warn!("{}", describe_chain(&err));
                    SpawnResponse::failed(describe_chain(&err))
                }
            }
        }
        Err(err) => {
            tracing::warn!("invalid spawn request: {}", describe_chain(&err));
            SpawnResponse::failed(describe_chain(&err))
        }
    };
    let body = serde_json::to_vec(&response)?;
    writer
        .write_all(&body)
        .await
        .map_err(Error::SpawnProtocolError)?;
    writer.shutdown().await.map_err(Error::SpawnProtocolError)?;
    Ok(())
}

/// Read one request from a connection.
///
/// The request is complete as soon as a whole JSON value has
/// arrived, and the client may also mark its end by closing its
/// side of the connection.
pub(super) async fn read_request<R>(mut reader: R) -> Result<SpawnRequest>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0; 8192];
    loop {
        let count = reader
            .read(&mut chunk)
            .await
            .map_err(Error::SpawnProtocolError)?;
        if count == 0 {
            return Ok(serde_json::from_slice(&buf)?);
        }
        buf.extend_from_slice(&chunk[..count]);
        if buf.len() as u64 > MAX_REQUEST_SIZE {
            return Err(Error::SpawnRequestTooLarge(MAX_REQUEST_SIZE));
        }
        let mut values = serde_json::Deserializer::from_slice(&buf).into_iter::<SpawnRequest>();
        match values.next() {
            Some(Ok(request)) => return Ok(request),
            // only part of the value has arrived
            Some(Err(err)) if err.is_eof() => continue,
            Some(Err(err)) => return Err(err.into()),
            None => continue,
        }
    }
}
