mod analysis;
mod image;
mod slot;

pub use analysis::{AnalysisResult, BusinessRelevance};
pub use image::{ImageRecord, ImageSource, StockAttribution};
pub use slot::{MatchOrigin, Slot, SlotDefinition};
