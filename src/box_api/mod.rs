mod client;
mod events;
mod files;
mod folders;
pub mod types;

pub use client::BoxClient;
pub use types::BoxItem;
