use rand::distr::{Alphanumeric, SampleString};
use rand::rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub fn generate_ticket_id() -> String {
  Alphanumeric.sample_string(&mut rng(), 64)
}

pub fn generate_guest_name() -> String {
  format!("Guest-{}", Alphanumeric.sample_string(&mut rng(), 6))
}

/// Time-ordered id for players, tracks and races.
pub fn generate_id() -> String {
  Uuid::now_v7().to_string()
}

fn since_epoch() -> Duration {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
}

pub fn now() -> i64 {
  since_epoch().as_secs() as i64
}

pub fn now_millis() -> i64 {
  since_epoch().as_millis() as i64
}
