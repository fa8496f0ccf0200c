// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod correlator;
pub mod descriptor;
pub mod transport;
pub mod tunnel;

pub use correlator::{Correlator, CorrelationError, Resolution};
pub use descriptor::{
  ExchangeFailure, ExchangeOutcome, ForwardedRequest, HeaderFields, MessageBody,
  RequestDescriptor, ResponseDescriptor, ResponseSink,
};
pub use tunnel::{id::ConnectionId, id::RequestId, Connection, TunnelCloseReason};
