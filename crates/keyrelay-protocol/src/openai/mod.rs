pub mod chat;
pub mod completion;
pub mod image;
pub mod models;
