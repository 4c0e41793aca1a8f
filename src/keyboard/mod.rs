//! Keystroke sliding-window feature extraction.

pub mod extractor;

pub use extractor::KeyboardExtractor;
