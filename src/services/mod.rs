pub mod backoff;
pub mod delivery;
pub mod dispatcher;
pub mod hit_builder;
pub mod storage;
