// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{SpawnRequest, SpawnResponse};
use crate::{Error, Result};

/// Send a single request to the spawn service listening on
/// the given loopback port and wait for its answer.
pub async fn request(port: u16, request: &SpawnRequest) -> Result<SpawnResponse> {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
        .await
        .map_err(Error::SpawnProtocolError)?;
    let body = serde_json::to_vec(request)?;
    stream
        .write_all(&body)
        .await
        .map_err(Error::SpawnProtocolError)?;
    // the service reads until we stop writing
    stream.shutdown().await.map_err(Error::SpawnProtocolError)?;

    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .await
        .map_err(Error::SpawnProtocolError)?;
    Ok(serde_json::from_slice(&buf)?)
}
