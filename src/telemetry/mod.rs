pub mod logging;
pub mod spans;

pub use logging::{init_tracing, LoggingGuard};
pub use spans::{
    Annotation, EmbeddedSpanStore, PipelineSpans, SharedSpanStore, SpanRecord, SpanStore, Tracer,
};
