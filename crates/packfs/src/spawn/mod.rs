// Copyright (c) Contributors to the packfs project.
// SPDX-License-Identifier: Apache-2.0

//! A loopback service that lets processes running inside a mount
//! ask the supervisor to start new processes on their behalf.
//!
//! Each connection carries exactly one JSON encoded [`SpawnRequest`],
//! terminated by the client closing its write half, and receives
//! exactly one [`SpawnResponse`] before the server closes it.

pub mod client;
mod proto;
mod service;

pub use self::proto::{MAX_REQUEST_SIZE, SpawnRequest, SpawnResponse};
pub use self::service::SpawnService;
