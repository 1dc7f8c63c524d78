pub mod enhancement;
pub mod job;
pub mod reservation;
pub mod stage;
pub mod validation;
