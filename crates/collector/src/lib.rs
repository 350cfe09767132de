pub mod collector;
pub mod context;
pub mod detector;
pub mod events;
pub mod flamegraph;
pub mod reaper;
pub mod registry;
pub mod sampling;
pub mod stats;

pub use collector::{BackgroundTasks, Collector};
pub use context::TraceContext;
pub use events::CollectorEvent;
pub use flamegraph::{FlameNode, Flamegraph, SvgOptions};
