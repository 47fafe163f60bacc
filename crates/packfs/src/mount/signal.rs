// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use super::Mount;
use crate::{Error, Result};

/// A loopback port that forces its mount to detach.
///
/// Any connection at all is a trigger, nothing is read from
/// it or written to it. This gives processes that are stuck
/// inside a busy mount a way out without needing privileges
/// of their own.
#[derive(Debug)]
pub struct UnmountSignal {
    listener: TcpListener,
    address: SocketAddr,
}

impl UnmountSignal {
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(Error::ListenerError)?;
        let address = listener.local_addr().map_err(Error::ListenerError)?;
        Ok(Self { listener, address })
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Force an unmount of the given mount for every connection
    /// received, until accepting a connection fails.
    pub async fn serve(self, mount: Arc<Mount>) {
        tracing::debug!(name = %mount.name(), address = %self.address, "unmount signal listening");
        loop {
            let peer = match self.listener.accept().await {
                Ok((_stream, peer)) => peer,
                Err(err) => {
                    tracing::error!(name = %mount.name(), %err, "unmount signal stopped accepting connections");
                    return;
                }
            };
            tracing::info!(name = %mount.name(), %peer, "forced unmount requested");
            let mount = Arc::clone(&mount);
            tokio::spawn(async move { mount.force_unmount().await });
        }
    }

    /// Trigger the unmount signal listening on the given loopback port
    pub async fn trigger(port: u16) -> Result<()> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|err| Error::UnmountTriggerError(port, err))?;
        drop(stream);
        Ok(())
    }
}
