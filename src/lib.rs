//! Distress Monitor - voice-triggered emergency alerts
//!
//! This library listens to a transcript stream for distress phrases and,
//! on a match, runs a cancellable countdown before sending a
//! location-enriched alert to every configured contact:
//! - Phrase detection with per-cycle debounce
//! - Cancellable countdown with per-second ticks
//! - Bounded, never-failing location resolution
//! - Staggered multi-recipient dispatch
//! - Automatic restart of the speech source on transient failure

pub mod composer;
pub mod config;
pub mod contacts;
pub mod countdown;
pub mod detection;
pub mod dispatch;
pub mod location;
pub mod machine;
pub mod session;
pub mod speech;

pub use composer::{ComposedMessage, MessageComposer};
pub use config::{ConfigError, MonitorConfig};
pub use contacts::{Contact, ContactError, ContactStore, InMemoryContactStore, JsonContactStore};
pub use countdown::{CountdownController, CountdownEvent, CountdownPhase, Urgency};
pub use detection::{DetectionEngine, DistressEvent, Transcript};
pub use dispatch::{
    whatsapp_link, DispatchError, DispatchRecord, DispatchRun, DispatchScheduler,
    NotificationSink, SinkError, WhatsAppLinkSink,
};
pub use location::{
    FixedLocation, LocationCapability, LocationError, LocationFix, LocationOutcome,
    LocationResolver, NoLocation,
};
pub use machine::{
    AlertStateMachine, Capabilities, MonitorError, MonitorHandle, MonitorNotice, MonitorState,
    MonitorStats,
};
pub use session::{AlertSession, SessionId, SessionState};
pub use speech::{
    ChannelSpeechSource, SourceEvents, SourceSignal, SpeechError, SpeechErrorKind, SpeechSource,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "distress_monitor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
