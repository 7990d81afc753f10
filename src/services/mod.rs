//! Service layer
//!
//! Admission, resolution and the two relay paths. The web layer only calls
//! into these; nothing here knows about routing.

pub mod admission;
pub mod classifier;
pub mod formats;
pub mod mux;
pub mod relay;
pub mod resolver;
pub mod ytdlp;

pub use admission::{AdmissionController, AdmissionTicket};
pub use classifier::{ClassificationRule, ErrorClassifier, RuleOutcome};
pub use mux::MuxPipeline;
pub use relay::{OutboundClient, StreamRelay};
pub use resolver::{BackendOutput, LookupRequest, ResolutionBackend, ResolutionCache, StreamResolver};
pub use ytdlp::YtDlpBackend;
