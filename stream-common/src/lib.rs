pub mod health;
pub mod metrics;
pub mod redis;
pub mod stream;
pub mod test_utils;
