//! Action-segmented mouse feature extraction.

pub mod extractor;

pub use extractor::MouseExtractor;
