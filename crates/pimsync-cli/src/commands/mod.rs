pub mod common;
pub mod compact;
pub mod dump;
pub mod info;
