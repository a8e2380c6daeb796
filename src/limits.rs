use crate::model::Ms;

/// One relay channel per printer; the header exposes 28 switchable pins.
pub const MAX_RESOURCES: usize = 28;
pub const MIN_RESOURCE_ID: u32 = 1;
pub const MAX_RESOURCE_ID: u32 = 28;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_GROUP_LEN: usize = 64;

/// A single reservation can't outlast a week.
pub const MAX_RESERVATION_MINUTES: i64 = 7 * 24 * 60;

pub const MINUTE_MS: Ms = 60_000;
