pub mod commands;
pub mod profiles;
pub mod settings;
