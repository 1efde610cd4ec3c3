//! Input contract between listener plugins and the preprocessor.
//!
//! Listeners deliver `(packet bytes, input info, source status)` triples; the
//! types here describe the second and third element. The packet buffer itself
//! is owned by the resulting [`Message`](crate::message::Message) from the
//! moment the preprocessor accepts it; listeners must not retain or mutate it
//! afterwards.

use serde::Serialize;
use std::net::IpAddr;

use crate::template::expiry::UdpTemplatePolicy;

/// Transport a message arrived over.
///
/// Template lifetime rules are transport-specific: TCP and SCTP exporters
/// withdraw templates explicitly, UDP templates age out via
/// [`UdpTemplatePolicy`], file inputs behave like TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Transport {
    /// Replay from a stored IPFIX file
    File,
    /// UDP exporter (template withdrawal is a protocol violation)
    Udp,
    /// TCP exporter
    Tcp,
    /// SCTP exporter
    Sctp,
}

/// Session state reported by the listener alongside each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceStatus {
    /// First event of a session; the preprocessor registers the source
    New,
    /// Ordinary mid-session traffic
    Opened,
    /// Session ended; flows through the ring as a close marker
    Closed,
}

/// Where the bytes came from, in the form the source fingerprint is built
/// from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InputOrigin {
    /// File input, identified by its path
    File {
        /// Path of the replayed file
        path: String,
    },
    /// Network input, identified by the exporter's address and port
    Network {
        /// Source address of the exporter
        addr: IpAddr,
        /// Source port of the exporter
        port: u16,
    },
}

/// Transport-typed description of one exporter endpoint.
///
/// One `InputInfo` is shared (via `Arc`) by every message of a session, so a
/// listener builds it once when the session opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputInfo {
    /// Transport the session runs over
    pub transport: Transport,
    /// Endpoint identity the [`SourceKey`](crate::source::SourceKey) is
    /// derived from
    pub origin: InputOrigin,
    /// Observation domain hint used for close markers, where no message
    /// header is available
    pub odid_hint: u32,
    /// UDP template lifetime knobs for this session; `None` falls back to
    /// the collector-wide default configured on the pipeline builder.
    /// Ignored for other transports.
    pub udp_policy: Option<UdpTemplatePolicy>,
}

impl InputInfo {
    /// Describes a file input.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            transport: Transport::File,
            origin: InputOrigin::File { path: path.into() },
            odid_hint: 0,
            udp_policy: None,
        }
    }

    /// Describes a network input on the given transport.
    pub fn network(transport: Transport, addr: IpAddr, port: u16) -> Self {
        Self {
            transport,
            origin: InputOrigin::Network { addr, port },
            odid_hint: 0,
            udp_policy: None,
        }
    }

    /// Sets the observation domain hint reported with close markers.
    #[must_use = "builder methods consume self and return a new value; the return value must be used"]
    pub fn with_odid_hint(mut self, odid: u32) -> Self {
        self.odid_hint = odid;
        self
    }

    /// Overrides the collector-wide UDP template lifetime policy for this
    /// session.
    #[must_use = "builder methods consume self and return a new value; the return value must be used"]
    pub fn with_udp_policy(mut self, policy: UdpTemplatePolicy) -> Self {
        self.udp_policy = Some(policy);
        self
    }

    /// True for UDP sessions, which get the relaxed template lifetime rules.
    pub fn is_udp(&self) -> bool {
        self.transport == Transport::Udp
    }
}
