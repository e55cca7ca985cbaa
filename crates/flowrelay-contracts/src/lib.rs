pub mod commands;
pub mod decoder;
pub mod events;
pub mod history;
pub mod protocol;
