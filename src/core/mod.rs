//! Core analysis modules

pub mod change;
pub mod classify;
pub mod filters;
pub mod pipeline;
pub mod registry;

// Re-export main types
pub use change::{
    check_image_quality, default_change_categories, ChangeCategory, ChangeDetector,
    ClassChangeReport, PixelChangeReport, QualityReport, QualityTier,
};
pub use classify::{
    class_overlay, ClassRemapTable, LandCoverClassifier, SegmentationBackend,
    SegmentationClassifier, SpectralClassifier, SpectralParams, UrbanChangeReport,
};
pub use pipeline::{RegionAnalyzer, RegionSummary};
pub use registry::{RunRegistry, RunState, RunStatus};
