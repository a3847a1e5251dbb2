pub mod menu;
pub mod rbac;
pub mod user;
