pub mod message;
pub mod notification;
pub mod post;
pub mod project;
pub mod read_state;
pub mod user;
