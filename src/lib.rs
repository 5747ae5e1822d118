pub mod config;
pub mod constants;
pub mod dataset;
pub mod frame;
pub mod instruments;
pub mod mask;
pub mod partition;
pub mod pipeline;
pub mod specstack_errors;
pub mod telluric;
pub mod template;
pub mod template_cache;
pub mod time;

pub use config::{CacheMode, PipelineConfig};
pub use dataset::Dataset;
pub use frame::provider::{FrameProvider, InMemoryProvider};
pub use frame::{Frame, FrameArrays, FrameDescriptor};
pub use pipeline::{PipelineReport, StackPipeline};
pub use specstack_errors::SpecStackError;
pub use template::StellarTemplate;
pub use template_cache::TemplateStore;
