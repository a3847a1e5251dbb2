pub mod auth;
pub mod health;
pub mod menus;
pub mod rbac;
pub mod users;
