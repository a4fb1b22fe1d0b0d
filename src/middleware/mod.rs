//! Request instrumentation middleware

pub mod context;
pub mod custom_labels;
pub mod hooks;
pub mod layer;

pub use context::{HandlerException, RequestContext, ResponseInfo, TemplateName};
pub use custom_labels::LabelExtender;
pub use hooks::{AfterMiddleware, BeforeMiddleware, PANIC_EXCEPTION};
pub use layer::{MetricsLayers, after_middleware, before_middleware};
