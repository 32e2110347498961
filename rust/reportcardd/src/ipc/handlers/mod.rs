pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod publish;
pub mod reports;
pub mod scores;
pub mod setup;
pub mod students;
pub mod subjects;
