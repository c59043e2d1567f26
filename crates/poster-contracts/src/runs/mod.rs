pub mod history;
pub mod registry;
