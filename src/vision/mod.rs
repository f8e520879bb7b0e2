//! Visual validation for the observe phase.
//!
//! Each configured route is captured (screenshot plus browser console
//! errors), sent to a vision model, and the free-text reply is parsed into a
//! [`ValidationResult`]. Parsing never fails: an unusable reply becomes a
//! single `parse-error` issue.

pub mod observe;
pub mod parse;
pub mod types;

pub use observe::{Capture, CommandCapture, CommandVision, ScreenCapture, VisionAnalyzer, VisualValidator};
pub use parse::{
    CONSOLE_ERROR_CATEGORY, PARSE_ERROR_CATEGORY, PARSE_ERROR_DESCRIPTION, parse_vision_response,
};
pub use types::{Region, Severity, ValidationIssue, ValidationResult, ValidationStatus, all_approved};
