//! UDP template lifetime policy.
//!
//! UDP exporters cannot withdraw templates, so the collector ages them out:
//! a template expires when it has not been re-announced for
//! `template_life_time`, or (when `template_life_packet` is non-zero) when
//! more than that many messages arrived from its source since the last
//! sighting. Options templates use the `options_*` variants of the same
//! knobs.

use serde::Serialize;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::template::{Template, TemplateKind};

/// Default template lifetime for UDP sources, per RFC 7011 guidance.
pub const DEFAULT_TEMPLATE_LIFE_TIME: Duration = Duration::from_secs(1800);

/// Milliseconds since the first use of the collector clock.
///
/// Liveness stamps live in atomics, so wall time is folded onto a single
/// process-wide monotonic epoch.
pub(crate) fn uptime_millis() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Lifetime knobs of one UDP session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UdpTemplatePolicy {
    /// Idle time after which a data template expires
    pub template_life_time: Duration,
    /// Message-count gap after which a data template expires; 0 disables
    pub template_life_packet: u32,
    /// Idle time after which an options template expires
    pub options_template_life_time: Duration,
    /// Message-count gap after which an options template expires; 0 disables
    pub options_template_life_packet: u32,
}

impl Default for UdpTemplatePolicy {
    fn default() -> Self {
        Self {
            template_life_time: DEFAULT_TEMPLATE_LIFE_TIME,
            template_life_packet: 0,
            options_template_life_time: DEFAULT_TEMPLATE_LIFE_TIME,
            options_template_life_packet: 0,
        }
    }
}

impl UdpTemplatePolicy {
    /// Policy with the same time/packet limits for both template kinds.
    pub fn new(life_time: Duration, life_packet: u32) -> Self {
        Self {
            template_life_time: life_time,
            template_life_packet: life_packet,
            options_template_life_time: life_time,
            options_template_life_packet: life_packet,
        }
    }

    /// Idle-time limit for the given template kind.
    pub fn life_time(&self, kind: TemplateKind) -> Duration {
        match kind {
            TemplateKind::Data => self.template_life_time,
            TemplateKind::Options => self.options_template_life_time,
        }
    }

    /// Message-count limit for the given template kind; 0 means disabled.
    pub fn life_packet(&self, kind: TemplateKind) -> u32 {
        match kind {
            TemplateKind::Data => self.template_life_packet,
            TemplateKind::Options => self.options_template_life_packet,
        }
    }

    /// Whether the template has outlived this policy.
    ///
    /// `message_counter` is the source-local message count at the moment of
    /// the check.
    pub fn is_expired(&self, template: &Template, message_counter: u64) -> bool {
        let idle = uptime_millis().saturating_sub(template.last_seen_millis());
        if idle > self.life_time(template.kind()).as_millis() as u64 {
            return true;
        }

        let life_packet = self.life_packet(template.kind());
        life_packet > 0
            && message_counter.saturating_sub(template.last_seen_message())
                > u64::from(life_packet)
    }
}
