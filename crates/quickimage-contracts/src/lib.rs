pub mod events;
pub mod ids;
pub mod library;
pub mod models;
pub mod runs;
