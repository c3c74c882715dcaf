//! Headless dashboard feed: keeps the configured keys live and logs every
//! snapshot change and layer event.

pub mod report;
pub mod targets;
