pub mod announcements;
pub mod assignments;
pub mod attempts;
pub mod attendance;
pub mod auth;
pub mod books;
pub mod core;
pub mod courses;
pub mod modules;
pub mod quizzes;
