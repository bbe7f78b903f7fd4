//! Slot matching pipeline: content scanning, vision analysis with provider
//! fallback, stock photo escalation and the manifest-backed registry.

pub mod analysis;
pub mod cancel;
pub mod http;
pub mod matching;
pub mod pipeline;
pub mod registry;
pub mod scan;
pub mod stock;
pub mod vision;

pub use analysis::{AnalyzedImage, BatchAnalysis, ImageAnalysisService};
pub use cancel::CancelToken;
pub use http::ProviderError;
pub use matching::{MatchRun, MatchingEngine, SlotScorer, WeightedScorer};
pub use pipeline::{ImagePipeline, PipelineReport, ProviderStatus};
pub use registry::ImageRegistry;
pub use stock::StockPhotoService;
pub use vision::VisionChain;
