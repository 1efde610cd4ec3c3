#![doc = include_str!("../README.md")]

pub mod codec;
pub mod error;
pub mod input;
pub mod message;
pub mod preprocessor;
pub mod ring;
pub mod source;
pub mod template;
mod tests;

use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::preprocessor::Preprocessor;
use crate::template::dictionary::DEFAULT_TEMPLATE_CAPACITY;

// Re-export the types listeners and downstream stages interact with.
pub use crate::error::{ConfigError, DissectError};
pub use crate::input::{InputInfo, InputOrigin, SourceStatus, Transport};
pub use crate::message::{DataCouple, Message, RecordMeta, RecordView};
pub use crate::ring::{Ring, WriteError};
pub use crate::source::{SourceCounters, SourceKey, SourceRegistry, SourceScope};
pub use crate::template::dictionary::{DictionaryStats, TemplateDictionary, WithdrawOutcome};
pub use crate::template::events::{TemplateEvent, TemplateHook, TemplateHooks};
pub use crate::template::expiry::UdpTemplatePolicy;
pub use crate::template::{Template, TemplateKey, TemplateKind};

/// Default capacity of the output ring; sized for burst absorption, not for
/// steady-state buffering.
pub const DEFAULT_RING_CAPACITY: usize = 1024;

/// The assembled preprocessing pipeline.
///
/// One `Pipeline` holds the collector-wide state — template dictionary,
/// source registry and the output ring — and is shared (behind an `Arc` or by
/// reference) between all listener threads on the input side and all worker
/// threads draining [`output`](Pipeline::output) on the other.
///
/// # Shutdown
///
/// Stop the listeners first, then call [`shutdown`](Pipeline::shutdown):
/// readers drain the remaining messages and observe end-of-stream, after
/// which the pipeline can be dropped.
///
/// # Examples
///
/// ```rust
/// use ipfix_collector::Pipeline;
///
/// let pipeline = Pipeline::builder()
///     .with_ring_capacity(256)
///     .with_template_capacity(10_000)
///     .build()
///     .expect("valid configuration");
/// assert_eq!(pipeline.output().capacity(), 256);
/// ```
#[derive(Debug)]
pub struct Pipeline {
    dictionary: Arc<TemplateDictionary>,
    sources: Arc<SourceRegistry>,
    output: Arc<Ring<Message>>,
    preprocessor: Preprocessor,
    default_udp_policy: UdpTemplatePolicy,
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::builder()
            .build()
            .expect("default configuration is valid")
    }
}

impl Pipeline {
    /// Creates a new builder for configuring a [`Pipeline`].
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Feeds one listener event into the pipeline.
    ///
    /// See [`Preprocessor::process`] for the contract.
    pub fn process(&self, packet: Option<Vec<u8>>, input: Arc<InputInfo>, status: SourceStatus) {
        self.preprocessor.process(packet, input, status);
    }

    /// The ring downstream stages read messages from.
    pub fn output(&self) -> &Arc<Ring<Message>> {
        &self.output
    }

    /// The collector-wide template dictionary.
    pub fn dictionary(&self) -> &Arc<TemplateDictionary> {
        &self.dictionary
    }

    /// The collector-wide source registry.
    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    /// Utilization and activity counters of the template dictionary.
    pub fn dictionary_stats(&self) -> DictionaryStats {
        self.dictionary.stats()
    }

    /// Counters of every live source scope.
    pub fn source_stats(&self) -> Vec<(SourceScope, SourceCounters)> {
        self.sources.snapshot()
    }

    /// The UDP template lifetime policy used for sessions whose
    /// [`InputInfo`] carries no override.
    pub fn default_udp_policy(&self) -> &UdpTemplatePolicy {
        &self.default_udp_policy
    }

    /// Ages out the templates of one UDP scope per `policy`.
    ///
    /// Meant to be driven periodically by the embedding runtime; the hot
    /// path itself only *warns* about expired templates (best effort, see
    /// the preprocessor docs). Returns the number of templates removed.
    pub fn reap_udp_templates(&self, scope: SourceScope, policy: &UdpTemplatePolicy) -> usize {
        let message_counter = self
            .sources
            .get(scope)
            .map(|state| state.snapshot().packets)
            .unwrap_or(0);
        self.dictionary.reap_udp(scope, message_counter, policy)
    }

    /// Closes the output ring; readers drain and then observe
    /// end-of-stream.
    pub fn shutdown(&self) {
        self.output.close();
    }
}

/// Builder for configuring and constructing a [`Pipeline`].
///
/// # Examples
///
/// ```rust
/// use ipfix_collector::{Pipeline, TemplateEvent};
///
/// let pipeline = Pipeline::builder()
///     .with_ring_capacity(512)
///     .with_template_capacity(20_000)
///     .on_template_event(|event| {
///         if let TemplateEvent::Superseded { key, .. } = event {
///             eprintln!("exporter {:?} rewrote template {}", key.source, key.template_id);
///         }
///     })
///     .build()
///     .expect("valid configuration");
/// # drop(pipeline);
/// ```
#[derive(Clone)]
pub struct PipelineBuilder {
    ring_capacity: usize,
    template_capacity: usize,
    default_udp_policy: UdpTemplatePolicy,
    hooks: TemplateHooks,
}

// Custom Debug implementation to avoid printing closures
impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("ring_capacity", &self.ring_capacity)
            .field("template_capacity", &self.template_capacity)
            .field("default_udp_policy", &self.default_udp_policy)
            .field("hooks", &format!("{} hooks", self.hooks.len()))
            .finish()
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            template_capacity: DEFAULT_TEMPLATE_CAPACITY,
            default_udp_policy: UdpTemplatePolicy::default(),
            hooks: TemplateHooks::new(),
        }
    }
}

impl PipelineBuilder {
    /// Sets the capacity of the output ring.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    /// Sets the capacity backstop of the template dictionary.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_template_capacity(mut self, capacity: usize) -> Self {
        self.template_capacity = capacity;
        self
    }

    /// Sets the collector-wide UDP template lifetime policy.
    ///
    /// Applies to every UDP session whose [`InputInfo`] does not carry its
    /// own policy; sessions can still override it per input.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_udp_template_policy(mut self, policy: UdpTemplatePolicy) -> Self {
        self.default_udp_policy = policy;
        self
    }

    /// Registers a callback for template lifecycle events.
    ///
    /// Hooks fire inline on the preprocessing path and must be cheap.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn on_template_event<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TemplateEvent) + Send + Sync + 'static,
    {
        self.hooks.register(hook);
        self
    }

    /// Builds the `Pipeline` with the configured settings.
    pub fn build(self) -> Result<Pipeline, ConfigError> {
        if self.ring_capacity == 0 {
            return Err(ConfigError::InvalidRingCapacity(self.ring_capacity));
        }
        let template_capacity = NonZeroUsize::new(self.template_capacity)
            .ok_or(ConfigError::InvalidTemplateCapacity(self.template_capacity))?;

        let dictionary = Arc::new(TemplateDictionary::new(template_capacity, self.hooks));
        let sources = Arc::new(SourceRegistry::new());
        let output = Arc::new(Ring::with_capacity(self.ring_capacity));
        let preprocessor = Preprocessor::new(
            dictionary.clone(),
            sources.clone(),
            output.clone(),
            self.default_udp_policy.clone(),
        );

        Ok(Pipeline {
            dictionary,
            sources,
            output,
            preprocessor,
            default_udp_policy: self.default_udp_policy,
        })
    }
}
