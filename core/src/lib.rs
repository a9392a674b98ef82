pub mod artifact;
pub mod config;
pub mod error;
pub mod events;
pub mod icon;
pub mod mount;
pub mod pipeline;
pub mod process;
pub mod request;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{CompactionStrategy, Settings, ToolPaths};
pub use error::{DmgError, ErrorKind};
pub use events::{EventSink, EventStatus, ProgressEvent, Reporter, Stage};
pub use icon::{IconEmbedder, IconLookup, IconMethod};
pub use mount::{MountRegistry, MountedImageEntry};
pub use pipeline::{ConversionPipeline, PipelineOutcome};
pub use process::{Invocation, ProcessExecutor, ProcessResult, SystemExecutor};
pub use request::{
    Access, AttachRequest, ConversionRequest, CreateMode, CreationRequest, Direction, Filesystem,
    ImageFormat, Passphrase,
};
