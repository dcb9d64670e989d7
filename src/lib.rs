pub mod error;
pub mod config;
pub mod timeline;
pub mod channel;
pub mod scale;
pub mod window;
pub mod throttle;
pub mod features;
pub mod events;
pub mod source;
pub mod types;
pub mod server;
pub mod shared;
pub mod profiling;

pub use types::*;
pub use config::{BandDefinition, LayoutConfig, ServerConfig};
pub use error::{SegsrvError, Result};
pub use events::{Annotation, AnnotationInstance, EncodedEvents, EventRecord};
pub use features::{CancelTicket, CancellationToken, ChannelSummary, EpochGrid, FeatureMatrix};
pub use scale::{PhysRange, ScaleMode};
pub use server::{CacheVersions, SegmentServer, ServerState};
pub use shared::SharedSegmentServer;
pub use source::{AttachedChannel, InMemoryRecording, RecordingHeader, RecordingSource};
pub use throttle::{Resolution, SummaryReason};
pub use timeline::{ClockTick, Segment, Timeline};
pub use window::{Window, WindowStatus};
