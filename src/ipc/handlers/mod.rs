pub mod attendance;
pub mod auth;
pub mod catalog;
pub mod coordinators;
pub mod core;
pub mod courses;
pub mod dashboard;
pub mod enrollments;
pub mod families;
pub mod grading;
pub mod guardians;
pub mod incidents;
pub mod interests;
pub mod iq;
pub mod notifications;
pub mod profile;
pub mod students;
pub mod teachers;
