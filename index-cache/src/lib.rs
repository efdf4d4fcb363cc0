#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod artifact_cache;
pub mod broadcast;
pub mod clock;
pub mod error;
pub mod facade;
pub mod metadata_cache;
pub mod model;
pub mod singleflight;
pub mod traits;
mod util;

pub use artifact_cache::{ArtifactCache, ArtifactKey, ArtifactRead};
pub use broadcast::{BroadcastSession, Overflow, SubscriberReader};
pub use clock::{AdvanceableClock, Clock, SystemClock};
pub use error::{CoreError, Result};
pub use facade::CoreFacade;
pub use metadata_cache::{IndexSpec, MetadataCache};
pub use model::{normalize_project_name, FileEntry, ProjectListEntry, ProjectName, Yanked};
pub use singleflight::SingleFlight;
pub use traits::{ArtifactFetcher, ArtifactSource, FetchedMeta, MetadataFetcher, Storage};
