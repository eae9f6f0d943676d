pub mod hit;
pub mod job;
