// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Reverse HTTP relay.
//!
//! A relay server accepts public HTTP requests and hands them to peers that
//! connected to it from inside a restricted network. Peers attach either over
//! a WebSocket ([push](crate::common::protocol::transport::push)) or through
//! long-polling ([pull](crate::common::protocol::transport::pull)); every
//! exchange is matched back to its caller by a correlation id.
#![warn(unused_imports)]

pub mod client;
pub mod common;
pub mod server;
pub mod util;
