//! Notification workers.
//!
//! - `notifications.deliver`: confirmed live delivery with persistence fallback
//! - `events.domain`: domain events bridged to notification jobs and realtime broadcasts
//! - periodic sweep of the pending-delivery store

pub mod delivery;
pub mod recipients;
pub mod worker;
