pub mod bootcfg;
pub mod checksum;
pub mod error;
pub mod events;
pub mod executor;
pub mod models;
pub mod packages;
pub mod recipe;

pub use error::{BuildError, StageError};
pub use events::{progress_channel, BuildEvent, EventSender, LogLevel, ProgressReceiver, ProgressSender};
pub use executor::{BuildPipeline, PipelineSettings};
pub use models::{BuildRequest, ImageMeta, Release, ReleaseFamily, SourceMode, StageName};
pub use recipe::IsoRecipe;
