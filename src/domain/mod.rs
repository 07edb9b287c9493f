pub mod gestures;
pub mod layout;
pub mod models;
pub mod settings;
pub mod timers;
