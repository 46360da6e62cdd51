pub mod capacity;
pub mod collector;
pub mod config;
pub mod credentials;
pub mod db;
pub mod inventory;
