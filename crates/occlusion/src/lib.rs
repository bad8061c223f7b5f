//! Occlusion feedback from the render thread to the owner thread.

mod producer;
mod proxy;
mod results;

pub use producer::{OcclusionFeedbackProducer, RenderedView};
pub use proxy::{OcclusionProxyFactory, OcclusionProxyPool, ProxyHandle, ProxyPoolError};
pub use results::{DEFAULT_VISIBLE_PIXEL_THRESHOLD, OcclusionResults, evaluate_occlusion};
