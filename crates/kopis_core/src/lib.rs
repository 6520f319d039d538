pub mod carving;
pub mod config;
pub mod database;
mod error;
pub mod gpu;
pub mod layout;
pub mod matcher;
pub mod pattern;
pub mod queue;
pub mod scanners;
pub mod spec;
mod traits;
mod types;

pub use carving::{plan_carves, CarveExtent, CarvePolicy, CarveTask};
pub use config::{BackendKind, CarveOptions, Interrupt, RunContext};
pub use database::{MergePolicy, OffsetDatabase};
pub use error::{CoreError, Result};
pub use gpu::GpuBatchScanner;
pub use layout::OutputLayout;
pub use queue::BoundedQueue;
pub use scanners::{ChunkHits, CpuScanner};
pub use spec::{PatternSpec, SearchDirection, SpecCompiler, SpecSet};
pub use traits::{BlockSource, ChunkScanner};
pub use types::{Chunk, Occurrence, OffsetKind, OffsetRecord};
