//! Utilities module - text helpers shared by the session and safety code

pub mod text_utils;

pub use text_utils::TextUtils;
