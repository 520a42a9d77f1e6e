pub mod accounts;
pub mod analytics;
pub mod attendance;
pub mod backup_exchange;
pub mod catalog;
pub mod core;
pub mod marks;
pub mod results;
pub mod students;
pub mod teachers;
