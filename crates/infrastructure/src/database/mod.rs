pub mod manager;
pub mod mapping;
pub mod postgres;
pub mod sqlite;
